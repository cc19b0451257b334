//! Transport layer
//!
//! Raw byte connections that carry handshakes and records. Only TCP is
//! provided; the [`Dialer`] trait is the seam for tests and alternative
//! carriers.

mod tcp;

pub use tcp::TcpDialer;

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout")]
    Timeout,
}

/// Byte stream a raw connection can run over
pub trait RawIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RawIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Boxed raw connection
pub type BoxedIo = Box<dyn RawIo>;

/// Opens raw connections to the server
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr`
    async fn dial(&self, addr: &str) -> Result<BoxedIo, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            nodelay: true,
        }
    }
}
