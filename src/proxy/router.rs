//! Server-side stream routing

use super::{pipe, PipeStats, ProxyError};
use crate::server::AdmissionMode;
use crate::tunnel::Stream;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Maps accepted streams to backend addresses
#[derive(Debug, Clone)]
pub struct ProxyRouter {
    /// Proxy method name to backend address
    proxy_book: HashMap<String, String>,
    /// Backend for streams of administrative sessions
    control_backend: Option<String>,
    stream_timeout: Duration,
    connect_timeout: Duration,
}

impl ProxyRouter {
    /// Create a router
    pub fn new(
        proxy_book: HashMap<String, String>,
        control_backend: Option<String>,
        stream_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            proxy_book,
            control_backend,
            stream_timeout,
            connect_timeout,
        }
    }

    /// Backend address for a session's streams
    pub fn resolve(&self, mode: AdmissionMode, method: &str) -> Result<&str, ProxyError> {
        match mode {
            AdmissionMode::Admin => self
                .control_backend
                .as_deref()
                .ok_or(ProxyError::NoControlBackend),
            AdmissionMode::User => self
                .proxy_book
                .get(method)
                .map(String::as_str)
                .ok_or_else(|| ProxyError::UnknownMethod(method.to_string())),
        }
    }

    /// Dial the backend for `stream` and pipe until either side closes
    ///
    /// Any failure closes only this stream.
    pub async fn route(
        &self,
        mut stream: Stream,
        mode: AdmissionMode,
        method: &str,
    ) -> Result<PipeStats, ProxyError> {
        let id = stream.id();
        let backend = match self.resolve(mode, method) {
            Ok(addr) => addr.to_string(),
            Err(e) => {
                warn!("Stream {} not routed: {}", id, e);
                let _ = stream.close().await;
                return Err(e);
            }
        };

        let dial = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&backend)).await;
        let socket = match dial {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                warn!("Stream {} failed to connect to {}: {}", id, backend, e);
                let _ = stream.close().await;
                return Err(ProxyError::BackendUnavailable(format!("{}: {}", backend, e)));
            }
            Err(_) => {
                warn!("Stream {} timed out connecting to {}", id, backend);
                let _ = stream.close().await;
                return Err(ProxyError::BackendUnavailable(backend));
            }
        };
        socket.set_nodelay(true).ok();
        debug!("Stream {} connected to {}", id, backend);

        pipe(socket, stream, self.stream_timeout).await
    }
}
