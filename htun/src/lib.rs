//! Tunnel TCP connections through plain HTTP requests.
//!
//! The [`server`] side owns real TCP connections to destinations and exposes
//! them over a small request/response protocol. The [`client`] side accepts
//! local TCP connections and relays their bytes through that protocol.

pub mod client;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod server;
pub mod transport;

pub use endpoint::Endpoint;
pub use error::TunnelError;
pub use registry::{ConnectionRegistry, RegistryConfig};
