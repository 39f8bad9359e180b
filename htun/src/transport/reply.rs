use std::fmt;

/// First line of every successful receive stream, ahead of the frames.
pub const SENDING_MARKER: &[u8] = b"SENDING\r\n";

/// Message used when an id does not name a live connection.
pub const CONNECTION_CLOSED: &str = "Connection closed";

/// The one-line text bodies of the control operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Open(String),
    Received(u64),
    Active,
    Closed,
    Error(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => f.write_str("OK"),
            Reply::Open(id) => write!(f, "OPEN {id}"),
            Reply::Received(n) => write!(f, "RECEIVED {n}"),
            Reply::Active => f.write_str("ACTIVE"),
            Reply::Closed => f.write_str("CLOSED"),
            Reply::Error(message) => {
                // A message must not break the single-line body.
                let message = message.replace(['\r', '\n'], " ");
                write!(f, "ERROR {message}")
            }
        }
    }
}

impl Reply {
    pub fn error(message: impl fmt::Display) -> Self {
        Reply::Error(message.to_string())
    }

    /// Body as sent on the wire, `\r\n` terminated.
    pub fn to_body(&self) -> String {
        format!("{self}\r\n")
    }

    /// Parses a response body. Only the first line is considered and
    /// anything that is not exactly one of the known forms yields `None`.
    pub fn parse(body: &str) -> Option<Self> {
        let line = body.lines().next()?.trim_end_matches('\r');
        match line {
            "OK" => return Some(Reply::Ok),
            "ACTIVE" => return Some(Reply::Active),
            "CLOSED" => return Some(Reply::Closed),
            _ => {}
        }

        let (word, rest) = line.split_once(' ')?;
        match word {
            "OPEN" if !rest.is_empty() && !rest.contains(' ') => Some(Reply::Open(rest.to_owned())),
            "RECEIVED" => rest.parse().ok().map(Reply::Received),
            "ERROR" => Some(Reply::Error(rest.to_owned())),
            _ => None,
        }
    }
}
