//! Session multiplexer
//!
//! A session owns a pool of raw connections and a table of streams. Outbound
//! frames are spread over the pool round-robin; inbound frames from any pool
//! member go through the per-stream reorder buffer before delivery.
//!
//! Each stream direction has a send window of `stream_buffer_limit` bytes.
//! DATA spends it; the receiving reader returns it with WINDOW_UPDATE once the
//! bytes have been consumed, so a stalled reader stalls its peer's writer.
//!
//! Stream IDs: the client allocates odd IDs from 1, the server even IDs from 2.

use super::connection;
use super::stream::{StreamReader, StreamState, StreamWriter};
use super::{
    Frame, FrameType, ReorderBuffer, Stream, TunnelError, CONNECTION_QUEUE,
    DEFAULT_POOL_SIZE, DEFAULT_REORDER_BUFFER, DEFAULT_STREAM_BUFFER, MAX_STREAM_WINDOW,
    REORDER_TIMEOUT,
};
use crate::crypto::{Cipher, CipherSuite};
use crate::protocol::{IDLE_TIMEOUT, KEEPALIVE_INTERVAL};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

/// Largest run of skipped peer stream IDs tolerated before a violation
const MAX_ID_GAP: u32 = 1 << 16;

/// Which end of the tunnel this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn other_first_id(self) -> u32 {
        match self {
            Role::Client => Role::Server.first_stream_id(),
            Role::Server => Role::Client.first_stream_id(),
        }
    }

    /// Whether `id` belongs to the ID space this side allocates from
    fn owns(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id % 2 == 0,
        }
    }
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum raw connections in the pool
    pub pool_size: usize,
    /// Writer idle time before a keepalive is sent
    pub keepalive_interval: Duration,
    /// Inbound silence after which a raw connection is dropped
    pub idle_timeout: Duration,
    /// Per-stream send window: bytes in flight the peer has not consumed
    pub stream_buffer_limit: usize,
    /// Out-of-order bytes a stream may hold
    pub reorder_buffer_limit: usize,
    /// How long a sequence gap may stay open
    pub reorder_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT),
            stream_buffer_limit: DEFAULT_STREAM_BUFFER,
            reorder_buffer_limit: DEFAULT_REORDER_BUFFER,
            reorder_timeout: REORDER_TIMEOUT,
        }
    }
}

/// Multiplexer state for a single stream
struct StreamEntry {
    state: StreamState,
    reorder: ReorderBuffer,
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    /// Delivered bytes the reader has not consumed yet
    queued: Arc<AtomicUsize>,
    window: Arc<Semaphore>,
}

/// A pool member as seen by the dispatcher
struct ConnHandle {
    id: u64,
    tx: mpsc::Sender<Frame>,
    tasks: Vec<AbortHandle>,
    /// Listener slot held for as long as the connection is pooled
    _slot: Option<OwnedSemaphorePermit>,
}

impl ConnHandle {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct SessionState {
    streams: HashMap<u32, StreamEntry>,
    next_stream_id: u32,
    max_remote_id: u32,
    /// Peer IDs below `max_remote_id` whose first frame has not arrived yet
    skipped_remote_ids: HashSet<u32>,
    pool: Vec<ConnHandle>,
    next_conn_id: u64,
    accept_tx: Option<mpsc::UnboundedSender<Stream>>,
    housekeeping: Option<AbortHandle>,
    closed: bool,
}

pub(crate) struct SessionInner {
    id: u32,
    role: Role,
    suite: CipherSuite,
    config: SessionConfig,
    state: Mutex<SessionState>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
    closed_tx: watch::Sender<bool>,
    cursor: AtomicUsize,
}

/// A multiplexed session over a pool of raw connections
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create an empty session; raw connections are attached with
    /// [`Session::add_connection`]
    pub fn new(id: u32, role: Role, suite: CipherSuite, config: SessionConfig) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let state = SessionState {
            streams: HashMap::new(),
            next_stream_id: role.first_stream_id(),
            max_remote_id: 0,
            skipped_remote_ids: HashSet::new(),
            pool: Vec::new(),
            next_conn_id: 0,
            accept_tx: Some(accept_tx),
            housekeeping: None,
            closed: false,
        };

        Self {
            inner: Arc::new(SessionInner {
                id,
                role,
                suite,
                config,
                state: Mutex::new(state),
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                closed_tx,
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Session identifier chosen by the client
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Which end of the tunnel this is
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Negotiated cipher suite
    pub fn suite(&self) -> CipherSuite {
        self.inner.suite
    }

    /// Attach an authenticated raw connection to the pool
    pub fn add_connection<S>(&self, io: S, send: Cipher, recv: Cipher) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        SessionInner::add_connection(&self.inner, io, send, recv, None)
    }

    /// Attach a raw connection that keeps `slot` until it leaves the pool
    pub fn add_connection_with_slot<S>(
        &self,
        io: S,
        send: Cipher,
        recv: Cipher,
        slot: OwnedSemaphorePermit,
    ) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        SessionInner::add_connection(&self.inner, io, send, recv, Some(slot))
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self) -> Result<Stream, TunnelError> {
        let (stream, id) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(TunnelError::SessionClosed);
            }
            let id = state.next_stream_id;
            state.next_stream_id = id.checked_add(2).ok_or(TunnelError::StreamIdExhausted)?;
            (SessionInner::register_stream(&self.inner, &mut state, id, true), id)
        };

        if let Err(e) = self.inner.dispatch(Frame::new_stream(id)).await {
            self.inner.state.lock().streams.remove(&id);
            return Err(e);
        }

        trace!("Session {}: opened stream {}", self.inner.id, id);
        Ok(stream)
    }

    /// Wait for the next stream opened by the peer
    ///
    /// Returns `None` once the session is closed.
    pub async fn accept(&self) -> Option<Stream> {
        self.inner.accept_rx.lock().await.recv().await
    }

    /// Tear down the session
    pub fn close(&self) {
        self.inner.teardown("closed locally");
    }

    /// Wait until the session is torn down
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Whether the session has been torn down
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.inner.state.lock().streams.len()
    }

    /// Number of raw connections in the pool
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().pool.len()
    }

    /// Whether both handles refer to the same session
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("suite", &self.inner.suite)
            .finish()
    }
}

impl SessionInner {
    fn add_connection<S>(
        this: &Arc<Self>,
        io: S,
        send: Cipher,
        recv: Cipher,
        slot: Option<OwnedSemaphorePermit>,
    ) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        let conn_id = {
            let mut state = this.state.lock();
            if state.closed {
                return Err(TunnelError::SessionClosed);
            }
            if state.pool.len() >= this.config.pool_size {
                return Err(TunnelError::PoolFull);
            }
            let conn_id = state.next_conn_id;
            state.next_conn_id += 1;
            state.pool.push(ConnHandle {
                id: conn_id,
                tx,
                tasks: Vec::with_capacity(2),
                _slot: slot,
            });
            conn_id
        };

        let (read_half, write_half) = tokio::io::split(io);
        let weak = Arc::downgrade(this);
        let reader = tokio::spawn(connection::run_reader(
            read_half,
            recv,
            conn_id,
            this.config.idle_timeout,
            weak.clone(),
        ));
        let writer = tokio::spawn(connection::run_writer(
            write_half,
            send,
            conn_id,
            this.config.keepalive_interval,
            rx,
            weak.clone(),
        ));
        let tasks = vec![reader.abort_handle(), writer.abort_handle()];

        let mut state = this.state.lock();
        match state.pool.iter_mut().find(|c| c.id == conn_id) {
            Some(conn) => conn.tasks = tasks,
            None => {
                // Already lost or torn down while spawning
                for task in tasks {
                    task.abort();
                }
                return Err(TunnelError::SessionClosed);
            }
        }

        if state.housekeeping.is_none() {
            let period = (this.config.reorder_timeout / 4).max(Duration::from_millis(100));
            let task = tokio::spawn(run_housekeeping(weak, period));
            state.housekeeping = Some(task.abort_handle());
        }

        debug!(
            "Session {}: connection {} joined ({} in pool)",
            this.id,
            conn_id,
            state.pool.len()
        );
        Ok(())
    }

    /// Send window per stream, within what the peer accepts
    fn send_window(&self) -> usize {
        self.config.stream_buffer_limit.clamp(1, MAX_STREAM_WINDOW)
    }

    fn register_stream(
        this: &Arc<Self>,
        state: &mut SessionState,
        id: u32,
        opener: bool,
    ) -> Stream {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let window_size = this.send_window();
        let window = Arc::new(Semaphore::new(window_size));
        let queued = Arc::new(AtomicUsize::new(0));

        state.streams.insert(
            id,
            StreamEntry {
                state: StreamState::Open,
                reorder: ReorderBuffer::new(this.config.reorder_buffer_limit),
                inbound: Some(inbound_tx),
                queued: queued.clone(),
                window: window.clone(),
            },
        );

        // NEW consumes sequence 0 of the opener's direction
        let first_seq = if opener { 1 } else { 0 };
        Stream::new(
            StreamReader::new(id, inbound_rx, Arc::downgrade(this), queued),
            StreamWriter::new(id, Arc::downgrade(this), window, window_size, first_seq),
        )
    }

    fn pick_connection(&self) -> Result<(u64, mpsc::Sender<Frame>), TunnelError> {
        let state = self.state.lock();
        if state.closed || state.pool.is_empty() {
            return Err(TunnelError::SessionClosed);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % state.pool.len();
        let conn = &state.pool[index];
        Ok((conn.id, conn.tx.clone()))
    }

    /// Queue a frame on the next pool member
    ///
    /// A member whose writer is gone is dropped from the pool and the frame
    /// goes to the next one.
    pub(super) async fn dispatch(&self, mut frame: Frame) -> Result<(), TunnelError> {
        loop {
            let (conn_id, tx) = self.pick_connection()?;
            match tx.send(frame).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    self.remove_connection(conn_id, "writer gone");
                    frame = returned;
                }
            }
        }
    }

    /// Return `credit` consumed bytes of stream `id` to the peer
    ///
    /// Usable from synchronous code: queues directly when the picked member
    /// has room, otherwise hands the frame to a task.
    pub(super) fn grant_credit(this: &Arc<Self>, id: u32, credit: usize) {
        let mut remaining = credit;
        while remaining > 0 {
            let step = remaining.min(MAX_STREAM_WINDOW);
            remaining -= step;

            let frame = Frame::window_update(id, step as u32);
            let Ok((conn_id, tx)) = this.pick_connection() else {
                return;
            };
            let frame = match tx.try_send(frame) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(frame)) => frame,
                Err(mpsc::error::TrySendError::Closed(frame)) => {
                    this.remove_connection(conn_id, "writer gone");
                    frame
                }
            };
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };
            let session = Arc::clone(this);
            handle.spawn(async move {
                let _ = session.dispatch(frame).await;
            });
        }
    }

    /// Mark our direction closed and send CLOSE with sequence `seq`
    pub(super) async fn close_stream(&self, id: u32, seq: u64) -> Result<(), TunnelError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if let Some(entry) = state.streams.get_mut(&id) {
                entry.state = entry.state.close_local();
                if entry.state == StreamState::Closed {
                    state.streams.remove(&id);
                }
            }
        }
        trace!("Session {}: closing stream {}", self.id, id);
        self.dispatch(Frame::close(id, seq)).await
    }

    /// Route one inbound frame to its stream
    pub(super) fn handle_frame(this: &Arc<Self>, frame: Frame) -> Result<(), TunnelError> {
        if frame.frame_type == FrameType::Keepalive {
            return Ok(());
        }

        let mut guard = this.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }

        let id = frame.stream_id;
        if frame.frame_type == FrameType::WindowUpdate {
            return Self::apply_credit(this, state, id, frame.seq);
        }

        if !state.streams.contains_key(&id) {
            if this.role.owns(id) {
                if id < state.next_stream_id {
                    trace!("Session {}: frame for finished stream {}", this.id, id);
                    return Ok(());
                }
                return Err(TunnelError::Protocol(format!(
                    "Frame for unopened local stream {}",
                    id
                )));
            }

            if id <= state.max_remote_id && !state.skipped_remote_ids.remove(&id) {
                trace!("Session {}: frame for finished stream {}", this.id, id);
                return Ok(());
            }

            if id > state.max_remote_id {
                if (id - state.max_remote_id) / 2 > MAX_ID_GAP {
                    return Err(TunnelError::Protocol(format!(
                        "Stream ID {} jumps too far ahead",
                        id
                    )));
                }
                let first = state.max_remote_id.max(this.role.other_first_id());
                let mut skipped = first;
                if state.max_remote_id != 0 {
                    skipped += 2;
                }
                while skipped < id {
                    state.skipped_remote_ids.insert(skipped);
                    skipped += 2;
                }
                state.max_remote_id = id;
            }

            let stream = Self::register_stream(this, state, id, false);
            debug!("Session {}: peer opened stream {}", this.id, id);
            if let Some(accept_tx) = &state.accept_tx {
                // Waits in the backlog until accepted or torn down
                let _ = accept_tx.send(stream);
            }
        }

        let Some(entry) = state.streams.get_mut(&id) else {
            return Ok(());
        };
        if !entry.state.can_recv() {
            return Ok(());
        }

        entry.reorder.insert(frame)?;
        let mut discarded = 0;
        while let Some(ready) = entry.reorder.pop_ready() {
            match ready.frame_type {
                FrameType::New => {
                    if ready.seq != 0 {
                        return Err(TunnelError::Protocol(format!(
                            "Stream {} reopened at sequence {}",
                            id, ready.seq
                        )));
                    }
                }
                FrameType::Data if !ready.payload.is_empty() => {
                    let len = ready.payload.len();
                    let queued = entry.queued.fetch_add(len, Ordering::AcqRel) + len;
                    if queued > MAX_STREAM_WINDOW {
                        return Err(TunnelError::Protocol(format!(
                            "Stream {} overran its receive window ({} bytes)",
                            id, queued
                        )));
                    }
                    let delivered = match &entry.inbound {
                        Some(inbound) => inbound.send(ready.payload).is_ok(),
                        None => false,
                    };
                    if !delivered {
                        // Reader is gone: discard, but keep the peer's window open
                        entry.queued.fetch_sub(len, Ordering::AcqRel);
                        discarded += len;
                    }
                }
                FrameType::Close => {
                    entry.state = entry.state.close_remote();
                    entry.inbound = None;
                    break;
                }
                _ => {}
            }
        }

        if entry.state == StreamState::Closed {
            state.streams.remove(&id);
        }
        drop(guard);

        if discarded > 0 {
            Self::grant_credit(this, id, discarded);
        }
        Ok(())
    }

    fn apply_credit(
        this: &Arc<Self>,
        state: &mut SessionState,
        id: u32,
        credit: u64,
    ) -> Result<(), TunnelError> {
        let Some(entry) = state.streams.get(&id) else {
            trace!("Session {}: credit for finished stream {}", this.id, id);
            return Ok(());
        };
        let credit = credit as usize;
        if entry.window.available_permits() + credit > this.send_window() {
            return Err(TunnelError::Protocol(format!(
                "Stream {} credited beyond its window",
                id
            )));
        }
        entry.window.add_permits(credit);
        Ok(())
    }

    /// Called by a connection task when it stops
    pub(super) fn connection_ended(&self, conn_id: u64, result: Result<(), TunnelError>) {
        match result {
            Ok(()) => self.remove_connection(conn_id, "closed"),
            Err(e) if e.is_session_fatal() => {
                warn!("Session {}: connection {} failed: {}", self.id, conn_id, e);
                self.teardown(&e.to_string());
            }
            Err(e) => self.remove_connection(conn_id, &e.to_string()),
        }
    }

    fn remove_connection(&self, conn_id: u64, reason: &str) {
        let empty = {
            let mut state = self.state.lock();
            let Some(index) = state.pool.iter().position(|c| c.id == conn_id) else {
                return;
            };
            let conn = state.pool.swap_remove(index);
            conn.abort();
            debug!(
                "Session {}: connection {} left ({}), {} in pool",
                self.id,
                conn_id,
                reason,
                state.pool.len()
            );
            state.pool.is_empty()
        };

        if empty {
            self.teardown("connection pool exhausted");
        }
    }

    fn check_reorder_gaps(&self) -> Result<(), TunnelError> {
        let now = Instant::now();
        let state = self.state.lock();
        for (id, entry) in &state.streams {
            if let Some(age) = entry.reorder.gap_age(now) {
                if age > self.config.reorder_timeout {
                    return Err(TunnelError::Protocol(format!(
                        "Stream {} sequence gap open for {:?}",
                        id, age
                    )));
                }
            }
        }
        Ok(())
    }

    /// Close every connection and stream exactly once
    pub(super) fn teardown(&self, reason: &str) {
        let (pool, streams, housekeeping) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.accept_tx = None;
            (
                std::mem::take(&mut state.pool),
                std::mem::take(&mut state.streams),
                state.housekeeping.take(),
            )
        };

        for conn in &pool {
            conn.abort();
        }
        if let Some(task) = housekeeping {
            task.abort();
        }
        for entry in streams.values() {
            // Pending writers fail instead of waiting for window
            entry.window.close();
        }
        let stream_count = streams.len();
        drop(streams);

        self.closed_tx.send_replace(true);
        info!(
            "Session {} closed ({}), {} streams dropped",
            self.id, reason, stream_count
        );
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for conn in &state.pool {
            conn.abort();
        }
        if let Some(task) = state.housekeeping.take() {
            task.abort();
        }
    }
}

async fn run_housekeeping(session: Weak<SessionInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if let Err(e) = session.check_reorder_gaps() {
            warn!("Session {}: {}", session.id, e);
            session.teardown(&e.to_string());
            return;
        }
    }
}
