use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::READ_BUFFER_SIZE;

/// Length prefix size of every frame.
pub const HEADER_LEN: usize = 4;

/// A decoder refuses anything longer than what a server ever reads at once.
pub const MAX_FRAME_LEN: usize = READ_BUFFER_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Protocol error: got invalid frame length {0}")]
    InvalidLength(u32),

    #[error("Protocol error: stream ended inside a frame ({0} bytes buffered)")]
    Truncated(usize),
}

/// One unit of the receive stream: a big-endian `u32` length followed by the
/// payload. An empty payload is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl From<Bytes> for Frame {
    fn from(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl From<Vec<u8>> for Frame {
    fn from(payload: Vec<u8>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

impl Frame {
    pub fn heartbeat() -> Self {
        Self {
            payload: Bytes::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Header and payload in a single buffer, so one write puts a whole
    /// frame on the wire.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Incremental decoder for a framed byte stream.
///
/// Bytes are fed in whatever chunks the transport delivers; whole frames come
/// out in order. Heartbeats are returned as well and left to the caller.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len as usize > MAX_FRAME_LEN {
            return Err(FrameError::InvalidLength(len));
        }
        if self.buf.len() < HEADER_LEN + len as usize {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len as usize).freeze();
        Ok(Some(Frame { payload }))
    }

    /// Checks the stream ended on a frame boundary.
    pub fn finish(&self) -> Result<(), FrameError> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(FrameError::Truncated(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn heartbeat_is_four_zero_bytes() {
        assert_eq!(Frame::heartbeat().encode().as_ref(), &[0, 0, 0, 0]);
        assert!(Frame::heartbeat().is_heartbeat());
    }

    #[test]
    fn header_is_big_endian() {
        let encoded = Frame::from(vec![0xAB; 258]).encode();
        assert_eq!(&encoded[..4], &[0, 0, 1, 2]);
        assert_eq!(encoded.len(), 262);
    }

    #[test]
    fn payloads_survive_heartbeats_and_arbitrary_chunking() {
        let sizes = [1, 0, 17, 4096, 0, 0, MAX_FRAME_LEN, 3];
        let originals: Vec<Frame> = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| Frame::from(vec![i as u8; size]))
            .collect();

        let mut wire = BytesMut::new();
        for frame in &originals {
            wire.extend_from_slice(&frame.encode());
        }

        // Odd chunk size so headers and payloads straddle chunk boundaries.
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in wire.chunks(7) {
            decoder.extend(chunk);
            decoded.extend(decode_all(&mut decoder));
        }

        assert_eq!(decoded, originals);
        assert_eq!(decoder.finish(), Ok(()));

        let data: Vec<usize> = decoded
            .iter()
            .filter(|frame| !frame.is_heartbeat())
            .map(Frame::len)
            .collect();
        assert_eq!(data, vec![1, 17, 4096, MAX_FRAME_LEN, 3]);
    }

    #[test]
    fn partial_header_waits_for_more_bytes() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0]);
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.extend(&[0, 2, b'h']);
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.extend(b"i");
        assert_eq!(
            decoder.next_frame(),
            Ok(Some(Frame::from(Bytes::from_static(b"hi"))))
        );
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::InvalidLength(MAX_FRAME_LEN as u32 + 1))
        );
    }

    #[test]
    fn stream_ending_inside_a_frame_is_an_error() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0, 0, 5, 1, 2]);
        assert_eq!(decoder.next_frame(), Ok(None));
        assert_eq!(decoder.finish(), Err(FrameError::Truncated(6)));
    }
}
