//! HTTP side of the tunnel: the request handlers, the receive stream and
//! the listener that serves them.

pub mod auth;
pub mod handlers;
pub mod listener;
mod receive;
mod status;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};

use crate::registry::RegistryConfig;
use crate::transport::Reply;

pub use auth::{Authenticator, CurrentUser, UserStore};
pub use handlers::TunnelHandlers;
pub use listener::TunnelServer;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:9999";
pub const DEFAULT_BASE_PATH: &str = "/proxy";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Prefix of every route. `/` and the empty string both mean none.
    pub base_path: String,
    /// Quiet period after which a receive stream sends a heartbeat frame.
    pub keepalive_interval: Duration,
    /// Upper bound on opening a connection to a destination.
    pub connect_timeout: Duration,
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9999)),
            base_path: DEFAULT_BASE_PATH.to_owned(),
            keepalive_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            registry: RegistryConfig::default(),
        }
    }
}

/// Strips trailing slashes and makes sure a non-empty prefix starts with one.
pub fn normalize_base_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

pub fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into()).boxed()
}

pub(crate) fn text_response(status: StatusCode, reply: &Reply) -> Response<BoxBody> {
    let mut response = Response::new(full_body(reply.to_body()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_path_normalization() {
        assert_eq!(normalize_base_path("/proxy"), "/proxy");
        assert_eq!(normalize_base_path("/proxy/"), "/proxy");
        assert_eq!(normalize_base_path("proxy"), "/proxy");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path(""), "");
    }
}
