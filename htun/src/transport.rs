//! Bytes on the wire between the tunnel client and server.

pub mod frame;
pub mod reply;

pub use frame::{Frame, FrameDecoder, FrameError, MAX_FRAME_LEN};
pub use reply::{CONNECTION_CLOSED, Reply, SENDING_MARKER};

/// Read buffer used on both ends of a tunnel; also the largest frame payload.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;
