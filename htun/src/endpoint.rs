//! The destination side of a tunnel: one real TCP connection owned by the
//! server on behalf of a client.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tracing::debug;

/// Any duplex byte stream an [`Endpoint`] can own.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type Stream = Box<dyn Duplex>;

/// A duplex byte stream shared between the handlers of one connection.
///
/// Reads and writes go through separate halves so a long-running receive
/// never blocks a send. [`Endpoint::close`] may be called from anywhere, any
/// number of times; it wakes up in-flight operations, after which reads see
/// end of stream and writes fail with [`io::ErrorKind::NotConnected`].
pub struct Endpoint {
    peer: String,
    reader: Mutex<Option<ReadHalf<Stream>>>,
    writer: Mutex<Option<WriteHalf<Stream>>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Endpoint {
    pub fn new<S: Duplex>(stream: S, peer: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(Box::new(stream) as Stream);
        let (closed_tx, _) = watch::channel(false);
        Self {
            peer: peer.into(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            closed_tx,
        }
    }

    /// Opens a TCP connection to `host:port`.
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "Connected to {host}:{port}");
        Ok(Self::new(stream, format!("{host}:{port}")))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reads into `buf`, returning 0 at end of stream or once closed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow_and_update() {
            return Ok(0);
        }

        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Ok(0);
        };

        let read = tokio::select! {
            read = reader.read(buf) => Some(read),
            _ = closed_rx.wait_for(|closed| *closed) => None,
        };

        if read.is_none() || self.is_closed() {
            guard.take();
        }
        read.unwrap_or(Ok(0))
    }

    /// Writes and flushes all of `data`.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(not_connected());
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(not_connected());
        };

        let written = tokio::select! {
            written = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => Some(written),
            _ = closed_rx.wait_for(|closed| *closed) => None,
        };

        if written.is_none() || self.is_closed() {
            guard.take();
        }
        written.unwrap_or_else(|| Err(not_connected()))
    }

    /// Closes both halves. Never fails; later calls do nothing.
    ///
    /// A half that is busy in [`read`](Self::read) or
    /// [`write_all`](Self::write_all) is released by that call as soon as it
    /// observes the close.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed_tx.send_replace(true);

        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        debug!(peer = %self.peer, "Endpoint closed");
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "endpoint is closed")
}
