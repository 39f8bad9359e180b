//! The HTTP listener serving the tunnel routes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::auth::{self, Authenticator};
use super::{BoxBody, ServerConfig, TunnelHandlers};
use crate::error::{Result, TunnelError};
use crate::registry::ConnectionRegistry;

/// The tunnel server
pub struct TunnelServer {
    config: Arc<ServerConfig>,
    handlers: Arc<TunnelHandlers>,
    authenticator: Arc<dyn Authenticator>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelServer {
    /// Create a new server. Starts the registry's eviction sweep, so this
    /// must run inside a Tokio runtime.
    pub fn new(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let registry = ConnectionRegistry::start(config.registry.clone());
        let handlers = TunnelHandlers::new(
            &config.base_path,
            registry,
            config.keepalive_interval,
            config.connect_timeout,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config: Arc::new(config),
            handlers: Arc::new(handlers),
            authenticator,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.handlers.registry()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen;
        TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })
    }

    /// Bind to the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`shutdown`](Self::shutdown),
    /// then close every tunneled connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            base_path = %self.handlers.base_path(),
            "Tunnel server listening"
        );

        self.accept_loop(listener).await;
        self.registry().shutdown().await;
        Ok(())
    }

    /// Signal the server to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow_and_update() {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutting down tunnel server");
                        break;
                    }
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let handlers = Arc::clone(&self.handlers);
                            let authenticator = Arc::clone(&self.authenticator);

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    remote_addr,
                                    handlers,
                                    authenticator,
                                ).await {
                                    debug!(
                                        error = %e,
                                        remote_addr = %remote_addr,
                                        "Connection error"
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        handlers: Arc<TunnelHandlers>,
        authenticator: Arc<dyn Authenticator>,
    ) -> std::result::Result<(), hyper::Error> {
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handlers = Arc::clone(&handlers);
            let authenticator = Arc::clone(&authenticator);
            async move {
                debug!(method = %req.method(), uri = %req.uri(), remote_addr = %remote_addr, "Request");
                Ok::<_, Infallible>(serve_request(&handlers, authenticator.as_ref(), req).await)
            }
        });

        http1::Builder::new().serve_connection(io, service).await
    }
}

/// Authenticates `req`, then hands it to the tunnel operation it names.
pub async fn serve_request<B>(
    handlers: &TunnelHandlers,
    authenticator: &dyn Authenticator,
    req: Request<B>,
) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    match auth::authenticate(authenticator, req.headers()) {
        Some(user) => handlers.handle(req, &user).await,
        None => {
            debug!(uri = %req.uri(), "Rejected unauthenticated request");
            auth::unauthorized()
        }
    }
}
