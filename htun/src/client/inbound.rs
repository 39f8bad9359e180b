use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tracing::trace;

use super::api::ProxyApi;
use super::copy::ByteSource;
use super::error::ClientError;
use super::stats::TunnelStats;
use crate::transport::FrameDecoder;

/// Reads the destination's bytes out of a receive stream.
///
/// The marker line is skipped once, heartbeats are dropped, and only whole
/// frames are ever handed out: a stream cut inside a frame is an error.
pub struct InboundChannel {
    response: Option<reqwest::Response>,
    decoder: FrameDecoder,
    pending: Bytes,
    stats: Arc<TunnelStats>,
}

impl InboundChannel {
    pub async fn open(api: &ProxyApi, id: &str, stats: Arc<TunnelStats>) -> Result<Self, ClientError> {
        let response = api.receive(id).await?;
        let mut channel = Self {
            response: Some(response),
            decoder: FrameDecoder::new(),
            pending: Bytes::new(),
            stats,
        };
        channel.skip_marker().await?;
        Ok(channel)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        match self.response.as_mut() {
            Some(response) => Ok(response.chunk().await?),
            None => Ok(None),
        }
    }

    async fn skip_marker(&mut self) -> Result<(), ClientError> {
        loop {
            let Some(chunk) = self.next_chunk().await? else {
                return Err(ClientError::Garbled(
                    "receive stream ended before its first line".into(),
                ));
            };
            if let Some(end) = chunk.iter().position(|&b| b == b'\n') {
                self.decoder.extend(&chunk[end + 1..]);
                return Ok(());
            }
        }
    }

    /// Fills `buf` with payload bytes; 0 means the stream has ended.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                self.stats.add_received(n as u64);
                return Ok(n);
            }

            if let Some(frame) = self.decoder.next_frame()? {
                if frame.is_heartbeat() {
                    trace!("Received keepalive frame");
                    self.stats.add_heartbeat();
                } else {
                    self.pending = frame.into_payload();
                }
                continue;
            }

            match self.next_chunk().await? {
                Some(chunk) => self.decoder.extend(&chunk),
                None => {
                    self.decoder.finish()?;
                    return Ok(0);
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.response.take();
    }
}

impl ByteSource for InboundChannel {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(InboundChannel::read(self, buf).await?)
    }

    async fn close(&mut self) {
        InboundChannel::close(self);
    }
}
