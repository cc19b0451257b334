//! Proxy plumbing
//!
//! Provides:
//! - Bidirectional piping between a TCP socket and a tunnel stream
//! - Server-side routing of accepted streams to backends
//! - Decoy relay for connections that fail admission

pub mod decoy;
mod router;

pub use router::ProxyRouter;

use crate::tunnel::{Stream, TunnelError, MAX_FRAME_PAYLOAD};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Unknown proxy method: {0}")]
    UnknownMethod(String),

    #[error("No control backend configured")]
    NoControlBackend,

    #[error("Stream idle timeout")]
    Timeout,

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Bytes moved by a finished pipe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    /// Socket to stream
    pub upstream: u64,
    /// Stream to socket
    pub downstream: u64,
}

/// Pipe bytes between `socket` and `stream` until either side finishes
///
/// The pipe also ends once neither direction has moved data for
/// `idle_timeout`. Both sides are fully closed afterwards.
pub async fn pipe(
    socket: TcpStream,
    stream: Stream,
    idle_timeout: Duration,
) -> Result<PipeStats, ProxyError> {
    let id = stream.id();
    let (mut socket_read, mut socket_write) = socket.into_split();
    let (mut reader, mut writer) = stream.split();
    let (mut up, mut down) = (0u64, 0u64);

    let started = Instant::now();
    let last_activity = AtomicU64::new(0);
    let touch = || last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    let idle = || {
        let last = Duration::from_millis(last_activity.load(Ordering::Relaxed));
        started.elapsed().saturating_sub(last) >= idle_timeout
    };

    let result = {
        let upstream = async {
            let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
            loop {
                let n = match timeout(idle_timeout, socket_read.read(&mut buf)).await {
                    Ok(Ok(0)) => return Ok::<(), ProxyError>(()),
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) if idle() => return Err(ProxyError::Timeout),
                    Err(_) => continue,
                };
                touch();
                writer.write(&buf[..n]).await?;
                up += n as u64;
            }
        };

        let downstream = async {
            loop {
                match timeout(idle_timeout, reader.read_chunk()).await {
                    Ok(Some(chunk)) => {
                        touch();
                        socket_write.write_all(&chunk).await?;
                        down += chunk.len() as u64;
                    }
                    Ok(None) => return Ok::<(), ProxyError>(()),
                    Err(_) if idle() => return Err(ProxyError::Timeout),
                    Err(_) => continue,
                }
            }
        };

        // Wait for either direction to complete
        tokio::select! {
            r = upstream => r,
            r = downstream => r,
        }
    };

    let _ = writer.close().await;
    let _ = socket_write.shutdown().await;
    trace!("Stream {} pipe finished: {} up, {} down", id, up, down);

    result.map(|_| PipeStats {
        upstream: up,
        downstream: down,
    })
}
