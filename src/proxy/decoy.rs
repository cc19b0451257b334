//! Decoy relay
//!
//! A connection that fails admission is spliced to an unrelated server. The
//! bytes already consumed by the admission check are forwarded first, then
//! both directions are copied verbatim until either side closes.

use super::ProxyError;
use std::time::Duration;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Relay `conn` to `decoy_addr`, replaying `initial` first
///
/// Returns the bytes copied (client to decoy, decoy to client), excluding
/// `initial`.
pub async fn relay(
    mut conn: TcpStream,
    initial: &[u8],
    decoy_addr: &str,
    connect_timeout: Duration,
) -> Result<(u64, u64), ProxyError> {
    let mut decoy = tokio::time::timeout(connect_timeout, TcpStream::connect(decoy_addr))
        .await
        .map_err(|_| ProxyError::BackendUnavailable(decoy_addr.to_string()))?
        .map_err(|e| ProxyError::BackendUnavailable(format!("{}: {}", decoy_addr, e)))?;
    decoy.set_nodelay(true).ok();

    if !initial.is_empty() {
        decoy.write_all(initial).await?;
    }

    let copied = copy_bidirectional(&mut conn, &mut decoy).await?;
    debug!(
        "Decoy relay to {} finished: {} up, {} down",
        decoy_addr, copied.0, copied.1
    );
    Ok(copied)
}
