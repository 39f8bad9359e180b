//! The long-lived receive response.
//!
//! After the `SENDING` marker line the body is a sequence of frames. Data
//! read from the endpoint and keepalive heartbeats go through one channel, so
//! frames reach the body whole and in order.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame as BodyFrame;
use tokio::sync::{Notify, mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

use super::{BoxBody, CurrentUser};
use crate::endpoint::Endpoint;
use crate::registry::{ConnectionRegistry, EventStatus};
use crate::transport::{Frame, READ_BUFFER_SIZE, SENDING_MARKER};

/// Frames buffered between the pump and the response body.
const CHANNEL_DEPTH: usize = 16;

pub(super) fn stream(
    registry: ConnectionRegistry,
    id: String,
    endpoint: Arc<Endpoint>,
    keepalive_interval: Duration,
    user: CurrentUser,
) -> Response<BoxBody> {
    let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let pump = ReceivePump {
        registry,
        id,
        endpoint,
        keepalive_interval,
        user,
    };
    tokio::spawn(pump.run(tx));

    let body = StreamBody::new(
        ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(BodyFrame::data(chunk))),
    );
    let mut response = Response::new(BodyExt::boxed(body));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

enum Outcome {
    /// The destination closed its side.
    Complete,
    /// The connection was removed while streaming.
    Unregistered,
    /// The client stopped reading the response.
    ClientGone,
    EndpointFailed(io::Error),
}

struct ReceivePump {
    registry: ConnectionRegistry,
    id: String,
    endpoint: Arc<Endpoint>,
    keepalive_interval: Duration,
    user: CurrentUser,
}

impl ReceivePump {
    async fn run(self, tx: mpsc::Sender<Bytes>) {
        if tx.send(Bytes::from_static(SENDING_MARKER)).await.is_err() {
            self.finish(Outcome::ClientGone, 0);
            return;
        }

        let activity = Arc::new(Notify::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let keepalive = tokio::spawn(keepalive(
            tx.clone(),
            Arc::clone(&activity),
            self.keepalive_interval,
            stop_rx,
        ));

        let (outcome, bytes) = self.forward(&tx, &activity).await;

        stop_tx.send_replace(true);
        if let Err(e) = keepalive.await {
            warn!(id = %self.id, error = %e, "Keepalive task ended abnormally");
        }
        self.finish(outcome, bytes);
        // Dropping the last sender ends the response body.
    }

    async fn forward(&self, tx: &mpsc::Sender<Bytes>, activity: &Notify) -> (Outcome, u64) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut total: u64 = 0;

        loop {
            let read = tokio::select! {
                read = self.endpoint.read(&mut buf) => read,
                () = tx.closed() => return (Outcome::ClientGone, total),
            };
            let n = match read {
                Ok(0) => return (Outcome::Complete, total),
                Ok(n) => n,
                Err(e) => return (Outcome::EndpointFailed(e), total),
            };

            let frame = Frame::from(Bytes::copy_from_slice(&buf[..n])).encode();
            if tx.send(frame).await.is_err() {
                return (Outcome::ClientGone, total);
            }
            activity.notify_one();
            total += n as u64;
            trace!(id = %self.id, bytes = n, "Wrote frame");

            if !self.registry.refresh(&self.id) {
                return (Outcome::Unregistered, total);
            }
        }
    }

    fn finish(&self, outcome: Outcome, bytes: u64) {
        let id = self.id.as_str();
        match outcome {
            // A disconnect or eviction also ends in EOF; that record already
            // has its closing event.
            Outcome::Complete => {
                if self.registry.remove(id) {
                    self.registry.record_event(
                        id,
                        EventStatus::ReceiveComplete,
                        format!("user={} bytes={bytes}", self.user),
                    );
                }
                debug!(id = %id, bytes, "Receive complete");
            }
            Outcome::Unregistered => {
                debug!(id = %id, bytes, "Connection removed during receive");
            }
            Outcome::ClientGone => {
                self.registry.record_event(
                    id,
                    EventStatus::ReceiveError,
                    format!("user={} client stopped reading after {bytes} bytes", self.user),
                );
                debug!(id = %id, bytes, "Receive client went away");
            }
            Outcome::EndpointFailed(e) => {
                self.registry.remove(id);
                self.registry.record_event(
                    id,
                    EventStatus::ReceiveError,
                    format!("user={} {e}", self.user),
                );
                warn!(id = %id, error = %e, "Read from destination failed");
            }
        }
    }
}

/// Sends a heartbeat frame whenever `interval` passes without data.
async fn keepalive(
    tx: mpsc::Sender<Bytes>,
    activity: Arc<Notify>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            () = activity.notified() => continue,
            () = tokio::time::sleep(interval) => {}
        }

        // A full queue already carries data, which makes a heartbeat moot.
        match tx.try_send(Frame::heartbeat().encode()) {
            Ok(()) => trace!("Sent keepalive frame"),
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => break,
        }
    }
}
