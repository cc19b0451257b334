//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format (plaintext inside one record):
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |         Stream ID (4B)            |
//! +--------+--------+--------+--------+--------+
//! |          Sequence Number (8B)             |
//! +--------+--------+--------+--------+--------+
//! |  Payload Length (2B)   |     Payload      ...
//! +--------+--------+--------+--------+--------+
//! |              Padding (rest of record)     |
//! +--------+--------+--------+--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 15;

/// Maximum payload carried by one frame
pub const MAX_FRAME_PAYLOAD: usize = 16384;

/// Maximum random padding on a frame
pub const MAX_PADDING: usize = 255;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream open, always sequence 0 of the opener's direction
    New = 0x00,
    /// Stream data
    Data = 0x01,
    /// Half-close of the sender's direction
    Close = 0x02,
    /// Connection-level keepalive (stream 0)
    Keepalive = 0x03,
    /// Receive credit for the peer's direction of a stream, carried in the
    /// sequence field; outside the stream's sequence space
    WindowUpdate = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::New),
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::Close),
            0x03 => Ok(FrameType::Keepalive),
            0x04 => Ok(FrameType::WindowUpdate),
            _ => Err(TunnelError::Protocol(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 for connection-level frames)
    pub stream_id: u32,
    /// Per-stream, per-direction sequence number
    pub seq: u64,
    /// Payload data
    pub payload: Bytes,
    /// Padding length (random bytes appended after the payload)
    pub padding_len: usize,
}

impl Frame {
    /// Create a stream open frame
    pub fn new_stream(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::New,
            stream_id,
            seq: 0,
            payload: Bytes::new(),
            padding_len: 0,
        }
    }

    /// Create a data frame
    pub fn data(stream_id: u32, seq: u64, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            seq,
            payload,
            padding_len: 0,
        }
    }

    /// Create a stream close frame
    pub fn close(stream_id: u32, seq: u64) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            seq,
            payload: Bytes::new(),
            padding_len: 0,
        }
    }

    /// Create a keepalive frame with random padding
    pub fn keepalive(padding_len: usize) -> Self {
        Self {
            frame_type: FrameType::Keepalive,
            stream_id: 0,
            seq: 0,
            payload: Bytes::new(),
            padding_len: padding_len.min(MAX_PADDING),
        }
    }

    /// Return `credit` bytes of receive window to the sender of `stream_id`
    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self {
            frame_type: FrameType::WindowUpdate,
            stream_id,
            seq: credit as u64,
            payload: Bytes::new(),
            padding_len: 0,
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());

        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u64(self.seq);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);

        if self.padding_len > 0 {
            let mut padding = vec![0u8; self.padding_len];
            crate::crypto::random_bytes(&mut padding);
            buf.extend_from_slice(&padding);
        }

        buf
    }

    /// Decode a frame from one complete record plaintext
    pub fn decode(mut buf: Bytes) -> Result<Self, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TunnelError::Protocol(format!(
                "Truncated frame: {} bytes",
                buf.len()
            )));
        }

        let frame_type = FrameType::try_from(buf.get_u8())?;
        let stream_id = buf.get_u32();
        let seq = buf.get_u64();
        let payload_len = buf.get_u16() as usize;

        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_FRAME_PAYLOAD));
        }
        if payload_len > buf.len() {
            return Err(TunnelError::Protocol(format!(
                "Payload length {} overruns record of {} bytes",
                payload_len,
                buf.len()
            )));
        }

        let payload = buf.split_to(payload_len);
        let frame = Self {
            frame_type,
            stream_id,
            seq,
            payload,
            padding_len: buf.len(),
        };

        match frame.frame_type {
            FrameType::Keepalive if frame.stream_id != 0 => Err(TunnelError::Protocol(
                "Keepalive on a stream".to_string(),
            )),
            FrameType::WindowUpdate if !frame.payload.is_empty() => Err(
                TunnelError::Protocol("Window update with payload".to_string()),
            ),
            FrameType::WindowUpdate if frame.seq == 0 || frame.seq > u32::MAX as u64 => Err(
                TunnelError::Protocol(format!("Invalid window credit {}", frame.seq)),
            ),
            _ if frame.frame_type != FrameType::Keepalive && frame.stream_id == 0 => Err(
                TunnelError::Protocol("Stream frame on stream 0".to_string()),
            ),
            _ => Ok(frame),
        }
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + self.padding_len
    }
}
