//! The tunnel operations, one per route under the base path.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Body;
use tracing::{debug, info, warn};

use super::{BoxBody, CurrentUser, normalize_base_path, receive, status, text_response};
use crate::endpoint::Endpoint;
use crate::error::TunnelError;
use crate::registry::{ConnectionRegistry, EventStatus};
use crate::transport::{CONNECTION_CLOSED, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Auth,
    Connect,
    Send,
    Ping,
    Disconnect,
    Receive,
    Status,
}

impl Route {
    pub fn name(&self) -> &'static str {
        match self {
            Route::Auth => "auth",
            Route::Connect => "connect",
            Route::Send => "send",
            Route::Ping => "ping",
            Route::Disconnect => "disconnect",
            Route::Receive => "receive",
            Route::Status => "status",
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Route::Send => Method::POST,
            _ => Method::GET,
        }
    }

    /// Matches `path` exactly against `{base_path}/{name}`.
    pub fn resolve(base_path: &str, path: &str) -> Option<Self> {
        let name = path.strip_prefix(base_path)?.strip_prefix('/')?;
        match name {
            "auth" => Some(Route::Auth),
            "connect" => Some(Route::Connect),
            "send" => Some(Route::Send),
            "ping" => Some(Route::Ping),
            "disconnect" => Some(Route::Disconnect),
            "receive" => Some(Route::Receive),
            "status" => Some(Route::Status),
            _ => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dispatches authenticated requests to the tunnel operations.
#[derive(Clone)]
pub struct TunnelHandlers {
    base_path: String,
    registry: ConnectionRegistry,
    keepalive_interval: Duration,
    connect_timeout: Duration,
}

impl TunnelHandlers {
    pub fn new(
        base_path: &str,
        registry: ConnectionRegistry,
        keepalive_interval: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            base_path: normalize_base_path(base_path),
            registry,
            keepalive_interval,
            connect_timeout,
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn handle<B>(&self, req: Request<B>, user: &CurrentUser) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: fmt::Display,
    {
        let Some(route) = Route::resolve(&self.base_path, req.uri().path()) else {
            debug!(path = %req.uri().path(), "No such route");
            return text_response(StatusCode::NOT_FOUND, &Reply::error("Not found"));
        };
        if req.method() != route.method() {
            return text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &Reply::error(format!("Use {} for {route}", route.method())),
            );
        }

        let params = query_params(req.uri());
        match route {
            Route::Auth => self.auth(user),
            Route::Connect => self.connect(&params, user).await,
            Route::Send => self.send(&params, req.into_body(), user).await,
            Route::Ping => self.ping(&params),
            Route::Disconnect => self.disconnect(&params, user),
            Route::Receive => self.receive(&params, user),
            Route::Status => status::render(&self.registry, &params),
        }
    }

    // ====================================================================
    // Operations
    // ====================================================================

    fn auth(&self, user: &CurrentUser) -> Response<BoxBody> {
        debug!(user = %user, "Authentication check");
        text_response(StatusCode::OK, &Reply::Ok)
    }

    async fn connect(&self, params: &HashMap<String, String>, user: &CurrentUser) -> Response<BoxBody> {
        match self.open(params).await {
            Ok((endpoint, destination)) => {
                let id = self.registry.add(endpoint, destination.as_str(), user.name());
                self.registry.record_event(
                    &id,
                    EventStatus::Connect,
                    format!("user={user} destination={destination}"),
                );
                info!(id = %id, user = %user, destination = %destination, "Connection opened");
                text_response(StatusCode::OK, &Reply::Open(id))
            }
            Err(e) => {
                warn!(user = %user, error = %e, "Connect failed");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, &Reply::error(e))
            }
        }
    }

    async fn open(&self, params: &HashMap<String, String>) -> Result<(Endpoint, String), TunnelError> {
        let host = params
            .get("host")
            .filter(|host| !host.is_empty())
            .ok_or_else(|| TunnelError::InvalidDestination("host is required".into()))?;
        let port = params
            .get("port")
            .ok_or_else(|| TunnelError::InvalidDestination("port is required".into()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::InvalidDestination(format!("invalid port {port:?}")))?;

        let destination = format!("{host}:{port}");
        match tokio::time::timeout(self.connect_timeout, Endpoint::connect(host, port)).await {
            Ok(Ok(endpoint)) => Ok((endpoint, destination)),
            Ok(Err(source)) => Err(TunnelError::ConnectFailed {
                destination,
                source,
            }),
            Err(_) => Err(TunnelError::ConnectTimeout {
                destination,
                timeout: self.connect_timeout,
            }),
        }
    }

    async fn send<B>(&self, params: &HashMap<String, String>, mut body: B, user: &CurrentUser) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: fmt::Display,
    {
        let id = connection_id(params);
        let Some(endpoint) = self.registry.get_endpoint(id) else {
            debug!(id = %id, "Send to unknown connection");
            return closed_response();
        };

        let mut total: u64 = 0;
        while let Some(frame) = body.frame().await {
            let data = match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => data,
                    Err(_) => continue,
                },
                Err(e) => {
                    debug!(id = %id, error = %e, "Request body failed");
                    return text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &Reply::error(format!("Request body failed: {e}")),
                    );
                }
            };
            if data.is_empty() {
                continue;
            }

            if let Err(e) = endpoint.write_all(&data).await {
                warn!(id = %id, error = %e, "Write to destination failed");
                if self.registry.remove(id) {
                    self.registry.record_event(
                        id,
                        EventStatus::Disconnect,
                        format!("user={user} send failed: {e}"),
                    );
                }
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, &Reply::error(e));
            }
            total += data.len() as u64;

            if !self.registry.refresh(id) {
                debug!(id = %id, "Connection went away during send");
                return closed_response();
            }
        }

        debug!(id = %id, bytes = total, "Send");
        text_response(StatusCode::OK, &Reply::Received(total))
    }

    fn ping(&self, params: &HashMap<String, String>) -> Response<BoxBody> {
        let id = connection_id(params);
        if self.registry.refresh(id) {
            debug!(id = %id, "Ping: active");
            text_response(StatusCode::OK, &Reply::Active)
        } else {
            debug!(id = %id, "Ping: closed");
            text_response(StatusCode::NOT_FOUND, &Reply::Closed)
        }
    }

    fn disconnect(&self, params: &HashMap<String, String>, user: &CurrentUser) -> Response<BoxBody> {
        let id = connection_id(params);
        if self.registry.remove(id) {
            self.registry
                .record_event(id, EventStatus::Disconnect, format!("user={user}"));
            info!(id = %id, user = %user, "Connection closed");
        } else {
            debug!(id = %id, "Disconnect of unknown connection");
        }
        text_response(StatusCode::OK, &Reply::Closed)
    }

    fn receive(&self, params: &HashMap<String, String>, user: &CurrentUser) -> Response<BoxBody> {
        let id = connection_id(params);
        let Some(endpoint) = self.registry.get_endpoint(id) else {
            debug!(id = %id, "Receive from unknown connection");
            return closed_response();
        };
        receive::stream(
            self.registry.clone(),
            id.to_owned(),
            endpoint,
            self.keepalive_interval,
            user.clone(),
        )
    }
}

fn connection_id(params: &HashMap<String, String>) -> &str {
    params.get("id").map(String::as_str).unwrap_or_default()
}

fn closed_response() -> Response<BoxBody> {
    text_response(StatusCode::NOT_FOUND, &Reply::error(CONNECTION_CLOSED))
}

pub(crate) fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|query| url::form_urlencoded::parse(query.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use http_body_util::{BodyExt, Empty, Full};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::registry::RegistryConfig;

    fn handlers() -> TunnelHandlers {
        TunnelHandlers::new(
            "/proxy",
            ConnectionRegistry::new(RegistryConfig::default()),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    fn alice() -> CurrentUser {
        CurrentUser::new("alice")
    }

    async fn get(handlers: &TunnelHandlers, uri: &str) -> (StatusCode, String) {
        let req = Request::get(uri).body(Empty::<Bytes>::new()).unwrap();
        let response = handlers.handle(req, &alice()).await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post(handlers: &TunnelHandlers, uri: &str, data: &'static [u8]) -> (StatusCode, String) {
        let req = Request::post(uri)
            .body(Full::new(Bytes::from_static(data)))
            .unwrap();
        let response = handlers.handle(req, &alice()).await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    /// Opens a tunnel to a fresh local listener and returns its id with the
    /// destination side of the connection.
    async fn open_tunnel(handlers: &TunnelHandlers) -> (String, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (status, body) = get(handlers, &format!("/proxy/connect?host=127.0.0.1&port={port}")).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let Some(Reply::Open(id)) = Reply::parse(&body) else {
            panic!("unexpected connect body {body:?}");
        };

        let (destination, _) = listener.accept().await.unwrap();
        (id, destination)
    }

    #[test]
    fn routes_match_exact_paths_only() {
        assert_eq!(Route::resolve("/proxy", "/proxy/send"), Some(Route::Send));
        assert_eq!(Route::resolve("", "/ping"), Some(Route::Ping));
        assert_eq!(Route::resolve("/proxy", "/proxy/send/extra"), None);
        assert_eq!(Route::resolve("/proxy", "/proxysend"), None);
        assert_eq!(Route::resolve("/proxy", "/other/send"), None);
    }

    #[test]
    fn query_values_are_decoded() {
        let uri: Uri = "/proxy/connect?host=db%2Einternal&port=5432".parse().unwrap();
        let params = query_params(&uri);
        assert_eq!(params["host"], "db.internal");
        assert_eq!(params["port"], "5432");
    }

    #[tokio::test]
    async fn auth_answers_ok() {
        assert_eq!(
            get(&handlers(), "/proxy/auth").await,
            (StatusCode::OK, "OK\r\n".to_owned())
        );
    }

    #[tokio::test]
    async fn unknown_path_and_wrong_method() {
        let handlers = handlers();
        assert_eq!(
            get(&handlers, "/proxy/nope").await,
            (StatusCode::NOT_FOUND, "ERROR Not found\r\n".to_owned())
        );
        let (status, _) = get(&handlers, "/proxy/send?id=x").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn connect_rejects_bad_destinations() {
        let handlers = handlers();

        let (status, body) = get(&handlers, "/proxy/connect?port=80").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("ERROR "), "{body}");

        let (status, _) = get(&handlers, "/proxy/connect?host=localhost&port=http").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (status, body) = get(&handlers, &format!("/proxy/connect?host=127.0.0.1&port={port}")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("ERROR "));

        assert!(handlers.registry().is_empty());
        assert!(handlers.registry().events().is_empty());
    }

    #[tokio::test]
    async fn connect_send_ping_disconnect() {
        let handlers = handlers();
        let (id, mut destination) = open_tunnel(&handlers).await;
        assert_eq!(handlers.registry().events()[0].status(), EventStatus::Connect);

        let (status, body) = post(&handlers, &format!("/proxy/send?id={id}"), b"hello").await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "RECEIVED 5\r\n"));
        let mut buf = [0u8; 5];
        destination.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let (status, body) = get(&handlers, &format!("/proxy/ping?id={id}")).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "ACTIVE\r\n"));

        let (status, body) = get(&handlers, &format!("/proxy/disconnect?id={id}")).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "CLOSED\r\n"));
        assert_eq!(destination.read(&mut buf).await.unwrap(), 0);

        // Disconnect is idempotent, everything else reports the closure.
        let (status, body) = get(&handlers, &format!("/proxy/disconnect?id={id}")).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "CLOSED\r\n"));
        let (status, body) = get(&handlers, &format!("/proxy/ping?id={id}")).await;
        assert_eq!((status, body.as_str()), (StatusCode::NOT_FOUND, "CLOSED\r\n"));
        let (status, body) = post(&handlers, &format!("/proxy/send?id={id}"), b"late").await;
        assert_eq!(
            (status, body.as_str()),
            (StatusCode::NOT_FOUND, "ERROR Connection closed\r\n")
        );

        let statuses: Vec<EventStatus> = handlers
            .registry()
            .events()
            .iter()
            .map(|event| event.status())
            .collect();
        assert_eq!(statuses, vec![EventStatus::Connect, EventStatus::Disconnect]);
    }

    #[tokio::test]
    async fn empty_send_is_accepted() {
        let handlers = handlers();
        let (id, _destination) = open_tunnel(&handlers).await;
        let (status, body) = post(&handlers, &format!("/proxy/send?id={id}"), b"").await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "RECEIVED 0\r\n"));
    }

    #[tokio::test]
    async fn receive_of_unknown_id_is_not_found() {
        let (status, body) = get(&handlers(), "/proxy/receive?id=missing").await;
        assert_eq!(
            (status, body.as_str()),
            (StatusCode::NOT_FOUND, "ERROR Connection closed\r\n")
        );
    }

    #[tokio::test]
    async fn receive_streams_marker_then_frames() {
        let handlers = handlers();
        let (id, mut destination) = open_tunnel(&handlers).await;

        let req = Request::get(format!("/proxy/receive?id={id}"))
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = handlers.handle(req, &alice()).await;
        assert_eq!(response.status(), StatusCode::OK);

        destination.write_all(b"0123456789").await.unwrap();
        destination.shutdown().await.unwrap();
        drop(destination);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..9], b"SENDING\r\n");
        assert_eq!(&body[9..13], &[0, 0, 0, 10]);
        assert_eq!(&body[13..], b"0123456789");

        assert!(!handlers.registry().contains(&id));
        let last = handlers.registry().events().pop().unwrap();
        assert_eq!(last.status(), EventStatus::ReceiveComplete);
    }
}
