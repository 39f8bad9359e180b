//! Moving bytes from one side of a session to the other.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::READ_BUFFER_SIZE;

/// Something a [`CopyWorker`] reads from. `Ok(0)` is end of stream.
pub trait ByteSource: Send + 'static {
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Something a [`CopyWorker`] writes to.
pub trait ByteSink: Send + 'static {
    fn write_all(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        async { Ok(()) }
    }

    fn close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Read side of a Tokio stream.
pub struct IoSource<R>(pub R);

impl<R> ByteSource for IoSource<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }
}

/// Write side of a Tokio stream; closing shuts it down.
pub struct IoSink<W>(pub W);

impl<W> ByteSink for IoSink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.0.flush().await
    }

    async fn close(&mut self) {
        let _ = self.0.shutdown().await;
    }
}

#[derive(Default)]
struct CopyState {
    bytes: AtomicU64,
    success: AtomicBool,
    error: Mutex<Option<io::Error>>,
}

impl CopyState {
    fn fail(&self, e: io::Error) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
    }
}

/// Copies from a source to a sink on its own task until end of stream, an
/// error, or [`stop`](Self::stop).
///
/// When the task is done the source and sink are handed back through
/// [`finish`](Self::finish) so the owner decides how to close them.
pub struct CopyWorker<S, D> {
    name: &'static str,
    state: Arc<CopyState>,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<(S, D)>>,
    parts: Option<(S, D)>,
}

impl<S: ByteSource, D: ByteSink> CopyWorker<S, D> {
    pub fn spawn(name: &'static str, source: S, sink: D) -> Self {
        let state = Arc::new(CopyState::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(name, source, sink, Arc::clone(&state), stop_rx));

        Self {
            name,
            state,
            stop_tx,
            handle: Some(handle),
            parts: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// True once the source reached end of stream and everything was written.
    pub fn is_success(&self) -> bool {
        self.state.success.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<String> {
        self.state
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(ToString::to_string)
    }

    pub fn bytes_copied(&self) -> u64 {
        self.state.bytes.load(Ordering::Relaxed)
    }

    /// Asks the task to stop; an in-flight read or write is abandoned.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Waits up to `timeout` for the task. Returns whether it has finished.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return true;
        };
        let Ok(joined) = tokio::time::timeout(timeout, handle).await else {
            return false;
        };

        self.handle = None;
        match joined {
            Ok(parts) => self.parts = Some(parts),
            Err(e) => {
                warn!(worker = self.name, error = %e, "Copy task ended abnormally");
                self.state.fail(io::Error::other(e.to_string()));
            }
        }
        true
    }

    /// Stops the task, waits for it and returns the source and sink, unless
    /// the task panicked.
    pub async fn finish(mut self) -> Option<(S, D)> {
        self.stop();
        while !self.join(Duration::from_secs(1)).await {}
        self.parts.take()
    }
}

async fn run<S: ByteSource, D: ByteSink>(
    name: &'static str,
    mut source: S,
    mut sink: D,
    state: Arc<CopyState>,
    mut stop: watch::Receiver<bool>,
) -> (S, D) {
    let copied = tokio::select! {
        copied = pump(&mut source, &mut sink, &state) => Some(copied),
        _ = stop.wait_for(|stopped| *stopped) => None,
    };

    match copied {
        Some(Ok(())) => {
            state.success.store(true, Ordering::Release);
            debug!(worker = name, bytes = state.bytes.load(Ordering::Relaxed), "Copy finished");
        }
        Some(Err(e)) => {
            debug!(worker = name, error = %e, "Copy failed");
            state.fail(e);
        }
        None => debug!(worker = name, "Copy stopped"),
    }
    (source, sink)
}

async fn pump<S: ByteSource, D: ByteSink>(source: &mut S, sink: &mut D, state: &CopyState) -> io::Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&buf[..n]).await?;
        sink.flush().await?;
        state.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    struct FailingSink;

    impl ByteSink for FailingSink {
        async fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink is gone"))
        }
    }

    #[tokio::test]
    async fn copies_until_end_of_stream() {
        let (mut input, source) = duplex(64);
        let (sink, mut output) = duplex(64);
        let mut worker = CopyWorker::spawn("test", IoSource(source), IoSink(sink));

        input.write_all(b"hello world").await.unwrap();
        drop(input);

        assert!(worker.join(Duration::from_secs(1)).await);
        assert!(!worker.is_alive());
        assert!(worker.is_success());
        assert_eq!(worker.error(), None);
        assert_eq!(worker.bytes_copied(), 11);

        let (_source, mut sink) = worker.finish().await.unwrap();
        sink.close().await;
        let mut copied = Vec::new();
        output.read_to_end(&mut copied).await.unwrap();
        assert_eq!(copied, b"hello world");
    }

    #[tokio::test]
    async fn write_failure_is_kept() {
        let (mut input, source) = duplex(64);
        let mut worker = CopyWorker::spawn("test", IoSource(source), FailingSink);

        input.write_all(b"x").await.unwrap();
        assert!(worker.join(Duration::from_secs(1)).await);
        assert!(!worker.is_success());
        assert!(worker.error().unwrap().contains("sink is gone"));
        assert_eq!(worker.bytes_copied(), 0);
    }

    #[tokio::test]
    async fn join_times_out_while_running_and_stop_ends_it() {
        let (_input, source) = duplex(64);
        let (sink, _output) = duplex(64);
        let mut worker = CopyWorker::spawn("test", IoSource(source), IoSink(sink));

        assert!(!worker.join(Duration::from_millis(20)).await);
        assert!(worker.is_alive());

        worker.stop();
        assert!(worker.join(Duration::from_secs(1)).await);
        assert!(!worker.is_success());
        assert_eq!(worker.error(), None);
        assert!(worker.finish().await.is_some());
    }
}
