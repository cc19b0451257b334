//! Raw connection tasks
//!
//! Each pool member runs two tasks: a reader that decodes records and hands
//! frames to the session, and a writer that drains the member's outbound
//! queue and sends keepalives when idle.

use super::codec::{encode_record, read_frame, write_frame};
use super::session::SessionInner;
use super::{Frame, TunnelError, MAX_PADDING};
use crate::crypto::Cipher;
use std::sync::Weak;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::trace;

/// Coalesce queued frames up to this many bytes per socket write
const MAX_BATCH: usize = 64 * 1024;

pub(super) async fn run_reader<R>(
    mut reader: R,
    mut cipher: Cipher,
    conn_id: u64,
    idle_timeout: Duration,
    session: Weak<SessionInner>,
) where
    R: AsyncRead + Unpin,
{
    let result = loop {
        let frame = match timeout(idle_timeout, read_frame(&mut reader, &mut cipher)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(TunnelError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break Ok(());
            }
            Ok(Err(e)) => break Err(e),
            Err(_) => break Err(TunnelError::IdleTimeout),
        };

        let Some(inner) = session.upgrade() else {
            return;
        };
        if let Err(e) = SessionInner::handle_frame(&inner, frame) {
            break Err(e);
        }
    };

    trace!("Connection {} reader stopped: {:?}", conn_id, result);
    if let Some(inner) = session.upgrade() {
        inner.connection_ended(conn_id, result);
    }
}

pub(super) async fn run_writer<W>(
    mut writer: W,
    mut cipher: Cipher,
    conn_id: u64,
    keepalive: Duration,
    mut queue: mpsc::Receiver<Frame>,
    session: Weak<SessionInner>,
) where
    W: AsyncWrite + Unpin,
{
    let result = write_loop(&mut writer, &mut cipher, keepalive, &mut queue).await;

    trace!("Connection {} writer stopped: {:?}", conn_id, result);
    if let Some(inner) = session.upgrade() {
        inner.connection_ended(conn_id, result);
    }
}

async fn write_loop<W>(
    writer: &mut W,
    cipher: &mut Cipher,
    keepalive: Duration,
    queue: &mut mpsc::Receiver<Frame>,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH + 1024);

    loop {
        let first = match timeout(keepalive, queue.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            Err(_) => {
                let mut len = [0u8; 1];
                crate::crypto::random_bytes(&mut len);
                let padding = len[0] as usize % (MAX_PADDING + 1);
                write_frame(writer, cipher, &Frame::keepalive(padding)).await?;
                continue;
            }
        };

        batch.clear();
        encode_record(cipher, &first, &mut batch)?;

        while batch.len() < MAX_BATCH {
            match queue.try_recv() {
                Ok(frame) => encode_record(cipher, &frame, &mut batch)?,
                Err(_) => break,
            }
        }

        writer.write_all(&batch).await?;
        writer.flush().await?;
    }
}
