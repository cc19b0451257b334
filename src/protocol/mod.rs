//! Protocol definitions and constants

mod hello;

pub use hello::{HandshakeMessage, OpenedHandshake, Uid};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid handshake length: {0}")]
    InvalidLength(usize),

    #[error("Unknown cipher suite selector: {0}")]
    UnknownSuite(u8),

    #[error("Proxy method too long: {0} bytes")]
    MethodTooLong(usize),

    #[error("Invalid proxy method encoding")]
    InvalidMethod,

    #[error("Invalid user identifier: {0}")]
    InvalidUid(String),
}

/// Width of a user identifier
pub const UID_LEN: usize = 16;

/// Width of the proxy method field
pub const METHOD_LEN: usize = 12;

/// X25519 ephemeral key at the start of the handshake
pub const EPHEMERAL_LEN: usize = 32;

/// uid + method + suite + session id + timestamp
pub const HANDSHAKE_PAYLOAD_LEN: usize = UID_LEN + METHOD_LEN + 1 + 4 + 8;

/// Total handshake message size on the wire
pub const HANDSHAKE_LEN: usize = EPHEMERAL_LEN + HANDSHAKE_PAYLOAD_LEN + crate::crypto::TAG_LEN;

/// Accepted clock skew in seconds
pub const TIMESTAMP_WINDOW: u64 = 180;

/// Handshake timeout in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 10;

/// Idle timeout in seconds
pub const IDLE_TIMEOUT: u64 = 300;

/// Keepalive interval in seconds
pub const KEEPALIVE_INTERVAL: u64 = 15;

/// Stream idle timeout in seconds
pub const STREAM_TIMEOUT: u64 = 300;

/// Seconds since the unix epoch
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
