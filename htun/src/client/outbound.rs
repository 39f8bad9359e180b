use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::api::ProxyApi;
use super::copy::ByteSink;
use super::error::ClientError;
use super::stats::TunnelStats;

/// Writes bytes to the destination, one send request per write.
///
/// Opening pings the connection once to be sure it exists; after that a
/// background pinger keeps it alive until the channel is closed.
pub struct OutboundChannel {
    api: ProxyApi,
    id: String,
    stats: Arc<TunnelStats>,
    stop_tx: watch::Sender<bool>,
    pinger: Option<JoinHandle<()>>,
}

impl OutboundChannel {
    pub async fn open(
        api: ProxyApi,
        id: String,
        ping_interval: Duration,
        stats: Arc<TunnelStats>,
    ) -> Result<Self, ClientError> {
        api.ping(&id).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let pinger = tokio::spawn(ping_loop(api.clone(), id.clone(), ping_interval, stop_rx));

        Ok(Self {
            api,
            id,
            stats,
            stop_tx,
            pinger: Some(pinger),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), ClientError> {
        let sent = self.api.send(&self.id, Bytes::copy_from_slice(data)).await?;
        self.stats.add_sent(sent);
        Ok(())
    }

    /// Stops the pinger and waits for it.
    pub async fn close(&mut self) {
        self.stop_tx.send_replace(true);
        if let Some(pinger) = self.pinger.take() {
            if let Err(e) = pinger.await {
                warn!(id = %self.id, error = %e, "Pinger ended abnormally");
            }
        }
    }
}

impl Drop for OutboundChannel {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

impl ByteSink for OutboundChannel {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Ok(self.write(data).await?)
    }

    async fn close(&mut self) {
        OutboundChannel::close(self).await;
    }
}

async fn ping_loop(api: ProxyApi, id: String, interval: Duration, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            () = tokio::time::sleep(interval) => {}
        }

        let pinged = tokio::select! {
            pinged = api.ping(&id) => pinged,
            _ = stop.wait_for(|stopped| *stopped) => break,
        };
        match pinged {
            Ok(()) => debug!(id = %id, "Keepalive ping"),
            Err(e) => warn!(id = %id, error = %e, "Keepalive ping failed"),
        }
    }
}
