//! Server side of the tunnel
//!
//! Every accepted raw connection passes a one-shot gate:
//! ```text
//! Unauthenticated --(valid handshake)--> Admitted --> joins Session (uid, session id)
//!                 \--(anything else)---> Decoy ----> byte relay to redirect_addr
//! ```
//! Admitted sessions get a router task that maps each accepted stream to a
//! backend.

mod admission;

pub use admission::{
    AdmissionControl, AdmissionDecision, AdmissionMode, Admitted, RejectReason, ReplayFilter,
};

use crate::config::ServerSettings;
use crate::crypto::HandshakeRole;
use crate::protocol::{Uid, HANDSHAKE_LEN};
use crate::proxy::{decoy, ProxyRouter};
use crate::tunnel::{Role, Session};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Tunnel server
pub struct Server {
    settings: ServerSettings,
    admission: AdmissionControl,
    router: ProxyRouter,
    sessions: Mutex<HashMap<(Uid, u32), Session>>,
    conn_semaphore: Arc<Semaphore>,
}

impl Server {
    /// Create a server from validated settings
    pub fn new(settings: ServerSettings) -> Arc<Self> {
        let admission = AdmissionControl::new(
            settings.private_key.clone(),
            settings.users.clone(),
            settings.admin_uid,
            settings.timestamp_window,
        );
        let router = ProxyRouter::new(
            settings.proxy_book.clone(),
            settings.control_backend.clone(),
            settings.stream_timeout,
            settings.connect_timeout,
        );
        let conn_semaphore = Arc::new(Semaphore::new(settings.max_connections));

        if settings.users.is_empty() && settings.admin_uid.is_none() {
            warn!("No users configured - every connection will be sent to the decoy");
        }

        Arc::new(Self {
            settings,
            admission,
            router,
            sessions: Mutex::new(HashMap::new()),
            conn_semaphore,
        })
    }

    /// Accept raw connections until the listener fails
    ///
    /// Each connection holds one of `max_connections` slots while it is
    /// being gated, relayed to the decoy or pooled in a session.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> crate::Result<()> {
        loop {
            let permit = self
                .conn_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| crate::Error::Config("Connection limiter closed".to_string()))?;

            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer_addr, permit).await;
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Gate one raw connection
    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        slot: OwnedSemaphorePermit,
    ) {
        stream.set_nodelay(true).ok();

        let mut buf = vec![0u8; HANDSHAKE_LEN];
        let filled = read_handshake(&mut stream, &mut buf, self.settings.handshake_timeout).await;

        let decision = if filled == HANDSHAKE_LEN {
            self.admission.evaluate(&buf)
        } else {
            AdmissionDecision::Reject(RejectReason::Truncated(filled))
        };

        match decision {
            AdmissionDecision::Accept(admitted) => self.admit(stream, peer_addr, admitted, slot),
            AdmissionDecision::Reject(reason) => {
                debug!("Connection from {} sent to decoy: {}", peer_addr, reason);
                if let Err(e) = decoy::relay(
                    stream,
                    &buf[..filled],
                    &self.settings.redirect_addr,
                    self.settings.connect_timeout,
                )
                .await
                {
                    debug!("Decoy relay for {} ended: {}", peer_addr, e);
                }
            }
        }
    }

    /// Attach an admitted connection to its session, creating it if needed
    fn admit(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        admitted: Admitted,
        slot: OwnedSemaphorePermit,
    ) {
        let key = (admitted.uid, admitted.session_id);

        let (session, created) = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&key) {
                Some(session) if !session.is_closed() => (session.clone(), false),
                _ => {
                    let session = Session::new(
                        admitted.session_id,
                        Role::Server,
                        admitted.suite,
                        self.settings.session.clone(),
                    );
                    sessions.insert(key, session.clone());
                    (session, true)
                }
            }
        };

        if session.suite() != admitted.suite {
            warn!(
                "Connection from {} asked for {} on a {} session, dropped",
                peer_addr,
                admitted.suite,
                session.suite()
            );
            return;
        }

        let attached = admitted
            .keys
            .ciphers(admitted.suite, HandshakeRole::Responder)
            .map_err(crate::Error::from)
            .and_then(|(send, recv)| {
                session
                    .add_connection_with_slot(stream, send, recv, slot)
                    .map_err(crate::Error::from)
            });
        if let Err(e) = attached {
            debug!("Connection from {} not attached: {}", peer_addr, e);
            if created {
                self.remove_session(&key, &session);
            }
            return;
        }

        if created {
            info!(
                "Session {} opened for {} ({:?}, method '{}', {})",
                admitted.session_id, admitted.uid, admitted.mode, admitted.proxy_method, admitted.suite
            );
            let server = Arc::clone(self);
            tokio::spawn(async move {
                server
                    .run_session(key, session, admitted.mode, admitted.proxy_method)
                    .await;
            });
        } else {
            debug!(
                "Connection from {} joined session {} ({} in pool)",
                peer_addr,
                admitted.session_id,
                session.connection_count()
            );
        }
    }

    /// Route the session's streams until it is torn down
    async fn run_session(
        self: Arc<Self>,
        key: (Uid, u32),
        session: Session,
        mode: AdmissionMode,
        method: String,
    ) {
        let method: Arc<str> = Arc::from(method);
        while let Some(stream) = session.accept().await {
            let server = Arc::clone(&self);
            let method = Arc::clone(&method);
            tokio::spawn(async move {
                let id = stream.id();
                if let Err(e) = server.router.route(stream, mode, &method).await {
                    debug!("Stream {} ended: {}", id, e);
                }
            });
        }

        self.remove_session(&key, &session);
        info!("Session {} for {} finished", key.1, key.0);
    }

    fn remove_session(&self, key: &(Uid, u32), session: &Session) {
        let mut sessions = self.sessions.lock();
        if sessions.get(key).is_some_and(|s| s.same_as(session)) {
            sessions.remove(key);
        }
    }
}

/// Read what the peer sends first, up to `buf.len()` bytes
///
/// Waits up to `timeout` for the first read, then takes only bytes that
/// have already arrived. A short first flight is decided as it is, so a
/// decoy-bound client never waits on the gate. Returns the bytes read.
async fn read_handshake(stream: &mut TcpStream, buf: &mut [u8], timeout: Duration) -> usize {
    let mut filled = match tokio::time::timeout(timeout, stream.read(buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(_)) | Err(_) => return 0,
    };

    while filled > 0 && filled < buf.len() {
        match stream.try_read(&mut buf[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    filled
}
