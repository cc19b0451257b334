//! Client side of the tunnel
//!
//! [`SessionManager`] keeps one session to the server and rebuilds it
//! (fresh handshakes, fresh pool) whenever the previous one has been torn
//! down. [`route_tcp`] is the local glue that turns every accepted
//! application connection into a stream.

use crate::config::ClientSettings;
use crate::crypto::{random_u32, Cipher, HandshakeRole};
use crate::protocol::{unix_now, HandshakeMessage};
use crate::proxy::pipe;
use crate::transport::{BoxedIo, Dialer};
use crate::tunnel::{Role, Session, Stream, TunnelError};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Owns the client's session and its raw connection pool
pub struct SessionManager {
    settings: ClientSettings,
    dialer: Arc<dyn Dialer>,
    session: Mutex<Option<Session>>,
}

impl SessionManager {
    /// Create a manager; nothing is dialed until the first stream
    pub fn new(settings: ClientSettings, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            settings,
            dialer,
            session: Mutex::new(None),
        }
    }

    /// Open a stream, building or rebuilding the session first if needed
    pub async fn open_stream(&self) -> crate::Result<Stream> {
        let session = self.session().await?;
        match session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(TunnelError::SessionClosed) => {
                // Lost the pool between the check and the open
                debug!("Session {} closed under us, rebuilding", session.id());
                let session = self.session().await?;
                Ok(session.open_stream().await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current live session, handshaking a new one if there is none
    pub async fn session(&self) -> crate::Result<Session> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            info!("Session {} lost, rebuilding pool", session.id());
        }

        let session = self.build_session().await?;
        *current = Some(session.clone());
        Ok(session)
    }

    /// Tear down the current session, if any
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close();
        }
    }

    async fn build_session(&self) -> crate::Result<Session> {
        let session_id = random_u32();
        let pool_size = self.settings.session.pool_size;
        let session = Session::new(
            session_id,
            Role::Client,
            self.settings.suite,
            self.settings.session.clone(),
        );

        let mut dials = JoinSet::new();
        for _ in 0..pool_size {
            let dialer = Arc::clone(&self.dialer);
            let settings = self.settings.clone();
            dials.spawn(async move { connect(&*dialer, &settings, session_id).await });
        }

        let mut last_error = None;
        while let Some(joined) = dials.join_next().await {
            let result = joined
                .map_err(|e| crate::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
                .and_then(|r| r);
            match result {
                Ok((io, send, recv)) => {
                    if let Err(e) = session.add_connection(io, send, recv) {
                        last_error = Some(e.into());
                    }
                }
                Err(e) => {
                    warn!("Raw connection to {} failed: {}", self.settings.server, e);
                    last_error = Some(e);
                }
            }
        }

        let connected = session.connection_count();
        if connected == 0 {
            session.close();
            return Err(last_error
                .unwrap_or_else(|| crate::Error::Config("pool_size must be at least 1".into())));
        }

        info!(
            "Session {} established with {} ({}/{} connections, {})",
            session_id, self.settings.server, connected, pool_size, self.settings.suite
        );
        Ok(session)
    }
}

/// Dial one raw connection and send its handshake
async fn connect(
    dialer: &dyn Dialer,
    settings: &ClientSettings,
    session_id: u32,
) -> crate::Result<(BoxedIo, Cipher, Cipher)> {
    let mut io = dialer.dial(&settings.server).await?;

    let hello = HandshakeMessage {
        uid: settings.uid,
        proxy_method: settings.proxy_method.clone(),
        suite: settings.suite,
        session_id,
        timestamp: unix_now(),
    };
    let (wire, keys) = hello.seal(&settings.server_public_key)?;
    io.write_all(&wire).await?;
    io.flush().await?;

    let (send, recv) = keys.ciphers(settings.suite, HandshakeRole::Initiator)?;
    Ok((io, send, recv))
}

/// Accept local application connections and tunnel each one
pub async fn route_tcp(listener: TcpListener, manager: Arc<SessionManager>) -> crate::Result<()> {
    let stream_timeout = manager.settings.stream_timeout;
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        socket.set_nodelay(true).ok();
        debug!("Local connection from {}", peer_addr);

        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let stream = match manager.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("No tunnel for {}: {}", peer_addr, e);
                    return;
                }
            };
            let id = stream.id();
            match pipe(socket, stream, stream_timeout).await {
                Ok(stats) => debug!(
                    "Stream {} for {} done: {} up, {} down",
                    id, peer_addr, stats.upstream, stats.downstream
                ),
                Err(e) => debug!("Stream {} for {} ended: {}", id, peer_addr, e),
            }
        });
    }
}
