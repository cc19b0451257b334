//! Multiplexed stream handles

use super::session::SessionInner;
use super::{Frame, TunnelError, MAX_FRAME_PAYLOAD, WINDOW_UPDATE_THRESHOLD};
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, Semaphore};

/// Stream state as tracked by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has closed
    HalfClosedLocal,
    /// Remote side has closed
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

impl StreamState {
    /// State after our CLOSE is sent
    pub fn close_local(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    /// State after the peer's CLOSE is delivered
    pub fn close_remote(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }

    /// Whether the peer may still send data
    pub fn can_recv(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }
}

/// A bidirectional logical stream within a session
///
/// Reading yields 0 bytes once the peer has closed its direction or the
/// session is gone.
pub struct Stream {
    reader: StreamReader,
    writer: StreamWriter,
}

impl Stream {
    pub(super) fn new(reader: StreamReader, writer: StreamWriter) -> Self {
        Self { reader, writer }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.writer.id
    }

    /// Read into `buf`, returning 0 at end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.reader.read(buf).await
    }

    /// Next chunk of inbound data, `None` at end of stream
    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        self.reader.read_chunk().await
    }

    /// Send all of `data`
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        self.writer.write(data).await
    }

    /// Close our sending direction
    pub async fn close(&mut self) -> Result<(), TunnelError> {
        self.writer.close().await
    }

    /// Split into independently owned halves
    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id()).finish()
    }
}

/// Receiving half of a stream
///
/// Consumed bytes are returned to the peer's send window in batches of
/// [`WINDOW_UPDATE_THRESHOLD`], or as soon as everything delivered is read.
pub struct StreamReader {
    id: u32,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    session: Weak<SessionInner>,
    queued: Arc<AtomicUsize>,
    unreturned: usize,
}

impl StreamReader {
    pub(super) fn new(
        id: u32,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        session: Weak<SessionInner>,
        queued: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            inbound,
            pending: Bytes::new(),
            session,
            queued,
            unreturned: 0,
        }
    }

    fn consumed(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let left = self.queued.fetch_sub(n, Ordering::AcqRel).saturating_sub(n);
        self.unreturned += n;
        if self.unreturned >= WINDOW_UPDATE_THRESHOLD || left == 0 {
            let credit = std::mem::take(&mut self.unreturned);
            if let Some(session) = self.session.upgrade() {
                SessionInner::grant_credit(&session, self.id, credit);
            }
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Read into `buf`, returning 0 at end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.inbound.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        self.consumed(n);
        Ok(n)
    }

    /// Next chunk of inbound data, `None` at end of stream
    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        let chunk = if self.pending.is_empty() {
            self.inbound.recv().await?
        } else {
            std::mem::take(&mut self.pending)
        };
        self.consumed(chunk.len());
        Some(chunk)
    }
}

impl AsyncRead for StreamReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            match ready!(this.inbound.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.pending.len());
        let chunk = this.pending.split_to(n);
        buf.put_slice(&chunk);
        this.consumed(n);
        Poll::Ready(Ok(()))
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        // Unread data will never be consumed; hand its window back
        self.inbound.close();
        let mut unread = self.pending.len();
        while let Ok(chunk) = self.inbound.try_recv() {
            unread += chunk.len();
        }
        self.pending = Bytes::new();
        self.queued.fetch_sub(unread, Ordering::AcqRel);

        let credit = self.unreturned + unread;
        if credit > 0 {
            if let Some(session) = self.session.upgrade() {
                SessionInner::grant_credit(&session, self.id, credit);
            }
        }
    }
}

/// Sending half of a stream
///
/// Each DATA byte spends the stream's send window until the peer's reader
/// returns it. Dropping an open writer sends CLOSE in the background.
pub struct StreamWriter {
    id: u32,
    session: Weak<SessionInner>,
    window: Arc<Semaphore>,
    window_size: usize,
    next_seq: u64,
    closed: bool,
}

impl StreamWriter {
    pub(super) fn new(
        id: u32,
        session: Weak<SessionInner>,
        window: Arc<Semaphore>,
        window_size: usize,
        next_seq: u64,
    ) -> Self {
        Self {
            id,
            session,
            window,
            window_size: window_size.max(1),
            next_seq,
            closed: false,
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send all of `data`, split into frames
    ///
    /// Waits while the peer has not consumed enough earlier data to open the
    /// window for the next frame.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        if self.closed {
            return Err(TunnelError::StreamClosed);
        }

        for chunk in data.chunks(MAX_FRAME_PAYLOAD.min(self.window_size)) {
            self.window
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| TunnelError::SessionClosed)?
                .forget();

            let session = self.session.upgrade().ok_or(TunnelError::SessionClosed)?;
            let frame = Frame::data(self.id, self.next_seq, Bytes::copy_from_slice(chunk));
            self.next_seq += 1;
            session.dispatch(frame).await?;
        }
        Ok(())
    }

    /// Close our sending direction
    pub async fn close(&mut self) -> Result<(), TunnelError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let seq = self.next_seq;
        self.next_seq += 1;
        match self.session.upgrade() {
            Some(session) => session.close_stream(self.id, seq).await,
            None => Ok(()),
        }
    }

    /// Whether CLOSE has been sent
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let (id, seq) = (self.id, self.next_seq);
        handle.spawn(async move {
            let _ = session.close_stream(id, seq).await;
        });
    }
}
