//! Raw TCP dialer

use super::{BoxedIo, Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Dials plain TCP connections
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    /// Create a new TCP dialer
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Connect and return the concrete stream
    pub async fn connect(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let timeout = Duration::from_secs(self.config.connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedIo, TransportError> {
        Ok(Box::new(self.connect(addr).await?))
    }
}
