//! Tunnel layer - encrypted multiplexed sessions
//!
//! Provides:
//! - Frame encoding/decoding and the encrypted record codec
//! - Stream multiplexing over a pool of raw connections
//! - Per-stream reordering across pool members
//! - Keepalives, idle detection and per-stream flow control

mod codec;
mod connection;
mod frame;
mod reorder;
mod session;
mod stream;

pub use codec::{encode_record, read_frame, write_frame};
pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD, MAX_PADDING};
pub use reorder::ReorderBuffer;
pub use session::{Role, Session, SessionConfig};
pub use stream::{Stream, StreamReader, StreamWriter};

use crate::crypto::CryptoError;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Frame authentication failed")]
    Authentication,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Connection pool full")]
    PoolFull,

    #[error("Stream identifiers exhausted")]
    StreamIdExhausted,

    #[error("Connection idle timeout")]
    IdleTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(CryptoError),
}

impl From<CryptoError> for TunnelError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthenticationFailed => TunnelError::Authentication,
            other => TunnelError::Crypto(other),
        }
    }
}

impl TunnelError {
    /// Whether this error must tear down the whole session rather than a
    /// single raw connection
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Protocol(_)
                | TunnelError::Authentication
                | TunnelError::FrameTooLarge(..)
                | TunnelError::Crypto(_)
        )
    }
}

/// Maximum number of raw connections per session
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default per-stream send window (1 MB)
pub const DEFAULT_STREAM_BUFFER: usize = 1 << 20;

/// Largest per-stream send window (8 MB); a peer with more unconsumed bytes
/// outstanding violates the protocol. Never above the default reorder limit.
pub const MAX_STREAM_WINDOW: usize = 8 << 20;

/// Consumed bytes a reader accumulates before returning credit
pub const WINDOW_UPDATE_THRESHOLD: usize = 64 * 1024;

/// Out-of-order bytes a stream may hold before the session is failed (8 MB)
pub const DEFAULT_REORDER_BUFFER: usize = 8 << 20;

/// Maximum distance between the next expected and a buffered sequence number
pub const REORDER_WINDOW: u64 = 65536;

/// How long a sequence gap may stay open
pub const REORDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames queued per raw connection writer
pub const CONNECTION_QUEUE: usize = 256;
