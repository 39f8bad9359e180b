//! Local listener that turns every accepted connection into a tunnel session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::api::{ProxyApi, http_client};
use super::credentials::CredentialSource;
use super::error::ClientError;
use super::session::TunnelSession;
use super::stats::{StatsSnapshot, TunnelStats};

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Label used in logs.
    pub name: String,
    /// Base URL of the tunnel server, e.g. `http://proxy.example:9999/proxy`.
    pub proxy_url: String,
    pub username: Option<String>,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_addr: SocketAddr,
    pub ping_interval: Duration,
}

/// The client side of one tunnel configuration.
pub struct TunnelClient {
    config: Arc<TunnelConfig>,
    api: ProxyApi,
    credentials: Arc<dyn CredentialSource>,
    stats: Arc<TunnelStats>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelClient {
    pub fn new(config: TunnelConfig, credentials: Arc<dyn CredentialSource>) -> Result<Self, ClientError> {
        let api = ProxyApi::new(http_client()?, &config.proxy_url)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            api,
            credentials,
            stats: Arc::new(TunnelStats::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn bind(&self) -> Result<TcpListener, ClientError> {
        Ok(TcpListener::bind(self.config.local_addr).await?)
    }

    /// Bind the local address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ClientError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept local connections until [`shutdown`](Self::shutdown), then
    /// wait for every session to close.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ClientError> {
        info!(
            tunnel = %self.config.name,
            local_addr = %listener.local_addr()?,
            remote = %format!("{}:{}", self.config.remote_host, self.config.remote_port),
            proxy = %self.api.base(),
            "Tunnel listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    info!(tunnel = %self.config.name, "Shutting down tunnel");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer)) => {
                            debug!(tunnel = %self.config.name, peer = %peer, "Accepted local connection");
                            let _ = socket.set_nodelay(true);
                            let session = TunnelSession::new(
                                socket,
                                self.api.clone(),
                                Arc::clone(&self.config),
                                Arc::clone(&self.credentials),
                                Arc::clone(&self.stats),
                                self.shutdown_rx.clone(),
                            );
                            sessions.spawn(session.run());
                        }
                        Err(e) => {
                            warn!(tunnel = %self.config.name, error = %e, "Failed to accept connection");
                        }
                    }
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(tunnel = %self.config.name, error = %e, "Tunnel session ended abnormally");
                    }
                }
            }
        }

        drop(listener);
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!(tunnel = %self.config.name, error = %e, "Tunnel session ended abnormally");
            }
        }
        info!(tunnel = %self.config.name, stats = %self.stats(), "Tunnel stopped");
        Ok(())
    }

    /// Signal the listener and every session to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
