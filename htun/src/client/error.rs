use std::io;

use reqwest::StatusCode;
use thiserror::Error;

use crate::transport::FrameError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No credentials supplied")]
    NoCredentials,

    #[error("Connection closed by remote proxy: {0}")]
    Closed(String),

    #[error("Remote proxy could not open the connection: {0}")]
    ConnectFailed(String),

    #[error("Unexpected status {status} from remote proxy: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },

    #[error("Garbled response from remote proxy: {0:?}")]
    Garbled(String),

    #[error("Invalid proxy URL {0}")]
    InvalidUrl(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ClientError> for io::Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Io(e) => e,
            ClientError::Closed(_) => io::Error::new(io::ErrorKind::ConnectionReset, e),
            ClientError::Frame(_) | ClientError::Garbled(_) => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
            e => io::Error::other(e),
        }
    }
}
