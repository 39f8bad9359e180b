use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Failures of the server side of a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Missing or invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Unable to connect to {destination}: {source}")]
    ConnectFailed {
        destination: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {destination} timed out after {}", humantime::format_duration(*timeout))]
    ConnectTimeout {
        destination: String,
        timeout: Duration,
    },

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;
