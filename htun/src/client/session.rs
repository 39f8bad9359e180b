//! One local connection relayed through the tunnel.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::api::ProxyApi;
use super::copy::{ByteSink, ByteSource, CopyWorker, IoSink, IoSource};
use super::credentials::CredentialSource;
use super::error::ClientError;
use super::inbound::InboundChannel;
use super::listener::TunnelConfig;
use super::outbound::OutboundChannel;
use super::stats::TunnelStats;

/// How often the supervisor checks on the copy workers.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    Connecting,
    Streaming,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Authenticating => "AUTHENTICATING",
            SessionState::Connecting => "CONNECTING",
            SessionState::Streaming => "STREAMING",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

pub struct TunnelSession {
    socket: Option<TcpStream>,
    api: ProxyApi,
    config: Arc<TunnelConfig>,
    credentials: Arc<dyn CredentialSource>,
    stats: Arc<TunnelStats>,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
}

impl TunnelSession {
    pub fn new(
        socket: TcpStream,
        api: ProxyApi,
        config: Arc<TunnelConfig>,
        credentials: Arc<dyn CredentialSource>,
        stats: Arc<TunnelStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            socket: Some(socket),
            api,
            config,
            credentials,
            stats,
            shutdown,
            state: SessionState::Authenticating,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(tunnel = %self.config.name, from = %self.state, to = %next, "Session state");
        self.state = next;
    }

    /// Drives the session to [`SessionState::Closed`].
    pub async fn run(mut self) -> Result<(), ClientError> {
        self.stats.session_opened();
        let result = self.drive().await;
        self.stats.session_closed();
        self.transition(SessionState::Closed);
        result
    }

    async fn drive(&mut self) -> Result<(), ClientError> {
        let mut shutdown = self.shutdown.clone();
        let established = tokio::select! {
            established = self.establish() => established,
            _ = shutdown.wait_for(|stop| *stop) => Err(ClientError::Cancelled),
        };
        let (api, id) = match established {
            Ok(established) => established,
            Err(e) => {
                error!(tunnel = %self.config.name, error = %e, "Error during tunnel session setup");
                return Err(e);
            }
        };

        self.transition(SessionState::Streaming);
        let streamed = self.stream(&api, &id).await;

        match api.disconnect(&id).await {
            Ok(()) => debug!(id = %id, "Disconnected"),
            Err(e) => debug!(id = %id, error = %e, "Disconnect failed"),
        }
        info!(tunnel = %self.config.name, id = %id, "Tunnel session closed");
        streamed
    }

    async fn establish(&mut self) -> Result<(ProxyApi, String), ClientError> {
        let api = self.authenticate().await?;

        self.transition(SessionState::Connecting);
        let id = api
            .connect(&self.config.remote_host, self.config.remote_port)
            .await?;
        info!(
            tunnel = %self.config.name,
            id = %id,
            destination = %format!("{}:{}", self.config.remote_host, self.config.remote_port),
            "Tunnel session opened"
        );
        Ok((api, id))
    }

    async fn authenticate(&self) -> Result<ProxyApi, ClientError> {
        let target = self.api.target();
        let mut force = false;
        loop {
            let source = Arc::clone(&self.credentials);
            let prompt_target = target.clone();
            let username = self.config.username.clone();
            let supplied = tokio::task::spawn_blocking(move || {
                source.credentials(&prompt_target, username.as_deref(), force)
            })
            .await;
            let credentials = match supplied {
                Ok(Some(credentials)) => credentials,
                Ok(None) => return Err(ClientError::NoCredentials),
                Err(e) => {
                    error!(tunnel = %self.config.name, error = %e, "Credential source failed");
                    return Err(ClientError::NoCredentials);
                }
            };

            let api = self.api.with_credentials(credentials);
            if api.authenticate().await? {
                return Ok(api);
            }
            warn!(tunnel = %self.config.name, target = %target, "Credentials rejected by remote proxy");
            force = true;
        }
    }

    async fn stream(&mut self, api: &ProxyApi, id: &str) -> Result<(), ClientError> {
        let mut outbound = OutboundChannel::open(
            api.clone(),
            id.to_owned(),
            self.config.ping_interval,
            Arc::clone(&self.stats),
        )
        .await?;
        let inbound = match InboundChannel::open(api, id, Arc::clone(&self.stats)).await {
            Ok(inbound) => inbound,
            Err(e) => {
                outbound.close().await;
                return Err(e);
            }
        };

        let Some(socket) = self.socket.take() else {
            outbound.close().await;
            return Err(ClientError::Io(io::Error::from(io::ErrorKind::NotConnected)));
        };
        let (socket_in, socket_out) = socket.into_split();

        let mut upstream = CopyWorker::spawn("socket to proxy", IoSource(socket_in), outbound);
        let mut downstream = CopyWorker::spawn("proxy to socket", inbound, IoSink(socket_out));

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                done = upstream.join(POLL_INTERVAL) => if done {
                    report(&upstream);
                    break;
                },
                done = downstream.join(POLL_INTERVAL) => if done {
                    report(&downstream);
                    break;
                },
                _ = shutdown.wait_for(|stop| *stop) => {
                    debug!(id = %id, "Shutdown requested");
                    break;
                }
            }
        }

        self.transition(SessionState::Closing);
        let failure = upstream.error().or_else(|| downstream.error());
        let upstream = upstream.finish().await;
        let downstream = downstream.finish().await;

        // Each close stands alone.
        if let Some((mut socket_in, mut outbound)) = upstream {
            socket_in.close().await;
            outbound.close().await;
        }
        if let Some((mut inbound, mut socket_sink)) = downstream {
            socket_sink.close().await;
            inbound.close();
        }

        match failure {
            Some(message) => Err(ClientError::Io(io::Error::other(message))),
            None => Ok(()),
        }
    }
}

fn report<S: ByteSource, D: ByteSink>(worker: &CopyWorker<S, D>) {
    if worker.is_success() {
        debug!(worker = worker.name(), bytes = worker.bytes_copied(), "Copy terminated");
    } else {
        let message = worker
            .error()
            .unwrap_or_else(|| "terminated with unknown error".to_owned());
        error!(worker = worker.name(), bytes = worker.bytes_copied(), error = %message, "Copy failed");
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::client::credentials::Credentials;

    struct PanickingSource;

    impl CredentialSource for PanickingSource {
        fn credentials(&self, _target: &str, _username: Option<&str>, _force: bool) -> Option<Credentials> {
            panic!("terminal went away");
        }
    }

    async fn session(
        credentials: Arc<dyn CredentialSource>,
    ) -> (TunnelSession, TcpStream, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let config = TunnelConfig {
            name: "test".into(),
            proxy_url: "http://127.0.0.1:1/proxy".into(),
            username: None,
            remote_host: "db.internal".into(),
            remote_port: 5432,
            local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ping_interval: Duration::from_secs(30),
        };
        let api = ProxyApi::new(reqwest::Client::new(), &config.proxy_url).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = TunnelSession::new(
            accepted,
            api,
            Arc::new(config),
            credentials,
            Arc::new(TunnelStats::new()),
            shutdown_rx,
        );
        (session, local, shutdown_tx)
    }

    #[tokio::test]
    async fn failing_credential_source_ends_the_session() {
        let (session, mut local, _shutdown_tx) = session(Arc::new(PanickingSource)).await;
        assert_eq!(session.state(), SessionState::Authenticating);

        let result = session.run().await;
        assert!(matches!(result, Err(ClientError::NoCredentials)));

        let mut rest = Vec::new();
        local.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
