//! Local side of the tunnel: accepts TCP connections and relays each one
//! through the HTTP operations of a tunnel server.

pub mod api;
pub mod copy;
pub mod credentials;
pub mod error;
pub mod inbound;
pub mod listener;
pub mod outbound;
pub mod session;
pub mod stats;

pub use api::ProxyApi;
pub use copy::{ByteSink, ByteSource, CopyWorker};
pub use credentials::{CredentialSource, Credentials, PromptCredentials, StaticCredentials};
pub use error::ClientError;
pub use inbound::InboundChannel;
pub use listener::{TunnelClient, TunnelConfig};
pub use outbound::OutboundChannel;
pub use session::{SessionState, TunnelSession};
pub use stats::{StatsSnapshot, TunnelStats};
