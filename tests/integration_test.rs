//! Integration tests for Shadowmux
//!
//! Runs real servers, clients, backends and decoys over loopback TCP:
//! - Full round trips through admission, session and router
//! - Close propagation in both directions
//! - Thousands of concurrent streams on one session
//! - Decoy relay for everything that fails admission, without added latency
//! - Listener slots held by pooled connections
//! - Pool loss and transparent session rebuild

use shadowmux::config::{ClientSettings, ServerSettings};
use shadowmux::crypto::{CipherSuite, HandshakeRole, KeyPair, PublicKey};
use shadowmux::protocol::{unix_now, HandshakeMessage, Uid, HANDSHAKE_LEN};
use shadowmux::transport::TcpDialer;
use shadowmux::tunnel::{Role, Session, SessionConfig, Stream};
use shadowmux::{Server, SessionManager};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};

const DECOY_REPLY: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";
const CONTROL_GREETING: &[u8] = b"control plane ready";

/// Echo server counting accepted connections
async fn spawn_echo() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    (addr, hits)
}

/// Decoy that records everything a connection sends, then answers
async fn spawn_decoy() -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                socket.read_to_end(&mut received).await.unwrap();
                socket.write_all(DECOY_REPLY).await.unwrap();
                let _ = tx.send(received);
            });
        }
    });
    (addr, rx)
}

/// Decoy that answers as soon as the first bytes arrive
async fn spawn_eager_decoy() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {
                    let _ = socket.write_all(DECOY_REPLY).await;
                }
                let mut sink = Vec::new();
                let _ = socket.read_to_end(&mut sink).await;
            });
        }
    });
    addr
}

/// Backend that reports when its peer finished sending
async fn spawn_sink() -> (String, mpsc::UnboundedReceiver<Instant>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = socket.read_to_end(&mut sink).await;
                let _ = tx.send(Instant::now());
            });
        }
    });
    (addr, rx)
}

/// Backend that answers once and hangs up, reporting when it did
async fn spawn_closer() -> (String, mpsc::UnboundedReceiver<Instant>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                let _ = socket.read(&mut buf).await;
                socket.write_all(b"bye").await.unwrap();
                drop(socket);
                let _ = tx.send(Instant::now());
            });
        }
    });
    (addr, rx)
}

async fn spawn_control() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                socket.write_all(CONTROL_GREETING).await.unwrap();
                let mut sink = Vec::new();
                let _ = socket.read_to_end(&mut sink).await;
            });
        }
    });
    addr
}

async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// A running server plus everything it talks to
struct Harness {
    addr: String,
    public: PublicKey,
    user: Uid,
    admin: Uid,
    server: Arc<Server>,
    echo_hits: Arc<AtomicUsize>,
    decoy_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    eof_rx: mpsc::UnboundedReceiver<Instant>,
    closer_rx: mpsc::UnboundedReceiver<Instant>,
}

async fn start_server(with_control: bool) -> Harness {
    start_server_with(with_control, 10_000, None).await
}

/// Server with a connection limit and, optionally, a different decoy
async fn start_server_with(
    with_control: bool,
    max_connections: usize,
    decoy_override: Option<String>,
) -> Harness {
    let keypair = KeyPair::generate().unwrap();
    let user = Uid::generate();
    let admin = Uid::generate();

    let (echo, echo_hits) = spawn_echo().await;
    let (decoy, decoy_rx) = spawn_decoy().await;
    let (sink, eof_rx) = spawn_sink().await;
    let (closer, closer_rx) = spawn_closer().await;

    let mut proxy_book = HashMap::new();
    proxy_book.insert("echo".to_string(), echo);
    proxy_book.insert("sink".to_string(), sink);
    proxy_book.insert("closer".to_string(), closer);
    proxy_book.insert("dead".to_string(), dead_addr().await);

    let control_backend = if with_control {
        Some(spawn_control().await)
    } else {
        None
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let settings = ServerSettings {
        listen: addr.clone(),
        private_key: keypair.private.clone(),
        users: [user].into_iter().collect::<HashSet<_>>(),
        admin_uid: Some(admin),
        control_backend,
        proxy_book,
        redirect_addr: decoy_override.unwrap_or(decoy),
        session: SessionConfig::default(),
        stream_timeout: Duration::from_secs(30),
        timestamp_window: 180,
        handshake_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        max_connections,
    };
    let server = Server::new(settings);
    tokio::spawn(Arc::clone(&server).serve(listener));

    Harness {
        addr,
        public: keypair.public,
        user,
        admin,
        server,
        echo_hits,
        decoy_rx,
        eof_rx,
        closer_rx,
    }
}

fn client_settings(
    server: &str,
    public: &PublicKey,
    uid: Uid,
    method: &str,
    suite: CipherSuite,
    pool_size: usize,
) -> ClientSettings {
    ClientSettings {
        server: server.to_string(),
        server_public_key: public.clone(),
        uid,
        proxy_method: method.to_string(),
        suite,
        local_listen: "127.0.0.1:0".to_string(),
        session: SessionConfig {
            pool_size,
            ..SessionConfig::default()
        },
        stream_timeout: Duration::from_secs(30),
    }
}

fn manager_for(h: &Harness, method: &str, suite: CipherSuite, pool_size: usize) -> SessionManager {
    SessionManager::new(
        client_settings(&h.addr, &h.public, h.user, method, suite, pool_size),
        Arc::new(TcpDialer::default()),
    )
}

/// Read exactly `len` bytes from a stream
async fn read_len(stream: &mut Stream, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let chunk = tokio::time::timeout(Duration::from_secs(10), stream.read_chunk())
            .await
            .expect("read timed out")
            .expect("stream ended early");
        out.extend_from_slice(&chunk);
    }
    assert_eq!(out.len(), len);
    out
}

async fn expect_eof(stream: &mut Stream) {
    let next = tokio::time::timeout(Duration::from_secs(5), stream.read_chunk())
        .await
        .expect("no end-of-stream");
    assert!(next.is_none(), "expected end-of-stream, got data");
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Two sessions joined by `pool` raw TCP connections with real handshakes
async fn session_pair_over_tcp(pool: usize, suite: CipherSuite) -> (Session, Session) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_keys = KeyPair::generate().unwrap();
    let config = SessionConfig {
        pool_size: pool,
        ..SessionConfig::default()
    };
    let client = Session::new(9, Role::Client, suite, config.clone());
    let server = Session::new(9, Role::Server, suite, config);

    for _ in 0..pool {
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut dialed = dialed.unwrap();
        let (mut accepted, _) = accepted.unwrap();

        let hello = HandshakeMessage {
            uid: Uid::generate(),
            proxy_method: "echo".to_string(),
            suite,
            session_id: 9,
            timestamp: unix_now(),
        };
        let (wire, client_keys) = hello.seal(&server_keys.public).unwrap();
        dialed.write_all(&wire).await.unwrap();

        let mut buf = vec![0u8; HANDSHAKE_LEN];
        accepted.read_exact(&mut buf).await.unwrap();
        let opened = HandshakeMessage::open(&buf, &server_keys.private).unwrap();

        let (send, recv) = client_keys.ciphers(suite, HandshakeRole::Initiator).unwrap();
        client.add_connection(dialed, send, recv).unwrap();
        let (send, recv) = opened.keys.ciphers(suite, HandshakeRole::Responder).unwrap();
        server.add_connection(accepted, send, recv).unwrap();
    }
    (client, server)
}

fn spawn_session_echo(session: Session) {
    tokio::spawn(async move {
        while let Some(mut stream) = session.accept().await {
            tokio::spawn(async move {
                while let Some(chunk) = stream.read_chunk().await {
                    if stream.write(&chunk).await.is_err() {
                        break;
                    }
                }
                let _ = stream.close().await;
            });
        }
    });
}

/// Every payload size comes back byte-for-byte through the whole stack
#[tokio::test]
async fn test_round_trip_sizes() {
    let h = start_server(false).await;
    let manager = manager_for(&h, "echo", CipherSuite::ChaCha20Poly1305, 2);

    for (i, size) in [1usize, 15, 1000, 16_384, 16_385, 65_536, 100_000, 131_072]
        .into_iter()
        .enumerate()
    {
        let mut stream = manager.open_stream().await.unwrap();
        let payload = pattern(size, i as u8);
        stream.write(&payload).await.unwrap();
        let echoed = read_len(&mut stream, size).await;
        assert!(echoed == payload, "payload of {} bytes corrupted", size);
        stream.close().await.unwrap();
    }

    assert_eq!(h.server.session_count(), 1);
    assert_eq!(h.echo_hits.load(Ordering::SeqCst), 8);
}

/// Client-initiated close reaches the backend quickly
#[tokio::test]
async fn test_client_close_propagates() {
    let mut h = start_server(false).await;
    let manager = manager_for(&h, "sink", CipherSuite::Aes256Gcm, 1);

    let mut stream = manager.open_stream().await.unwrap();
    stream.write(b"hello").await.unwrap();
    // Let the backend connection come up before closing
    tokio::time::sleep(Duration::from_millis(200)).await;

    let closed_at = Instant::now();
    stream.close().await.unwrap();

    let eof_at = tokio::time::timeout(Duration::from_secs(5), h.eof_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        eof_at.duration_since(closed_at) < Duration::from_millis(100),
        "close took {:?}",
        eof_at.duration_since(closed_at)
    );
}

/// Server-side hang up reaches the client reader quickly
#[tokio::test]
async fn test_server_close_propagates() {
    let mut h = start_server(false).await;
    let manager = manager_for(&h, "closer", CipherSuite::Aes256Gcm, 2);

    let mut stream = manager.open_stream().await.unwrap();
    stream.write(b"hi").await.unwrap();
    assert_eq!(read_len(&mut stream, 3).await, b"bye");

    expect_eof(&mut stream).await;
    let eof_seen = Instant::now();
    let hung_up = h.closer_rx.recv().await.unwrap();
    assert!(
        eof_seen.duration_since(hung_up) < Duration::from_millis(100),
        "close took {:?}",
        eof_seen.duration_since(hung_up)
    );
}

/// 2000 simultaneously open streams on one session echo independently
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_streams() {
    const STREAMS: usize = 2000;
    let (client, server) = session_pair_over_tcp(4, CipherSuite::ChaCha20Poly1305).await;
    spawn_session_echo(server.clone());

    let mut streams = Vec::with_capacity(STREAMS);
    for _ in 0..STREAMS {
        streams.push(client.open_stream().await.unwrap());
    }
    assert_eq!(client.stream_count(), STREAMS);

    let mut tasks = JoinSet::new();
    for (i, mut stream) in streams.into_iter().enumerate() {
        tasks.spawn(async move {
            let payload = format!("stream {} says {}|", stream.id(), i).repeat(20).into_bytes();
            stream.write(&payload).await.unwrap();
            let echoed = read_len(&mut stream, payload.len()).await;
            assert_eq!(echoed, payload);
            stream.close().await.unwrap();
            expect_eof(&mut stream).await;
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    assert!(!client.is_closed());
    assert!(!server.is_closed());
}

/// Interleaving over a pool of four never reorders a stream's bytes
#[tokio::test]
async fn test_ordering_with_pool() {
    let h = start_server(false).await;
    let manager = manager_for(&h, "echo", CipherSuite::Aes256Gcm, 4);
    let session = manager.session().await.unwrap();
    assert_eq!(session.connection_count(), 4);

    let stream = manager.open_stream().await.unwrap();
    let (mut reader, mut writer) = stream.split();

    let writes = tokio::spawn(async move {
        for i in 0u32..5000 {
            writer.write(&i.to_be_bytes()).await.unwrap();
        }
        writer
    });

    let expected: Vec<u8> = (0u32..5000).flat_map(|i| i.to_be_bytes()).collect();
    let mut received = Vec::with_capacity(expected.len());
    while received.len() < expected.len() {
        let chunk = tokio::time::timeout(Duration::from_secs(10), reader.read_chunk())
            .await
            .unwrap()
            .unwrap();
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, expected);

    let mut writer = writes.await.unwrap();
    writer.close().await.unwrap();
}

/// Round trip and close behave the same for every cipher suite
#[tokio::test]
async fn test_every_cipher_suite() {
    for suite in CipherSuite::ALL {
        let h = start_server(false).await;
        let manager = manager_for(&h, "echo", suite, 2);

        let mut stream = manager.open_stream().await.unwrap();
        let payload = pattern(70_000, 7);
        stream.write(&payload).await.unwrap();
        assert!(read_len(&mut stream, payload.len()).await == payload, "{} corrupted", suite);

        stream.close().await.unwrap();
        expect_eof(&mut stream).await;
        manager.close().await;
    }
}

/// Bytes an unknown client sent, exactly as the decoy saw them
async fn send_to_decoy(h: &mut Harness, sent: &[u8]) -> Vec<u8> {
    let mut conn = TcpStream::connect(&h.addr).await.unwrap();
    conn.write_all(sent).await.unwrap();
    conn.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), conn.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, DECOY_REPLY);

    tokio::time::timeout(Duration::from_secs(5), h.decoy_rx.recv())
        .await
        .unwrap()
        .unwrap()
}

fn sealed_hello(h: &Harness, uid: Uid) -> Vec<u8> {
    HandshakeMessage {
        uid,
        proxy_method: "echo".to_string(),
        suite: CipherSuite::ChaCha20Poly1305,
        session_id: 77,
        timestamp: unix_now(),
    }
    .seal(&h.public)
    .unwrap()
    .0
}

/// Unknown identifiers and garbage are relayed verbatim to the decoy
#[tokio::test]
async fn test_rejected_connections_reach_decoy() {
    let mut h = start_server(false).await;

    // Unknown user, followed by what would have been records
    let mut unknown = sealed_hello(&h, Uid::generate());
    unknown.extend_from_slice(b"trailing bytes after the handshake");
    assert_eq!(send_to_decoy(&mut h, &unknown).await, unknown);

    // Tampered handshake for a real user
    let mut tampered = sealed_hello(&h, h.user);
    tampered[40] ^= 0x01;
    assert_eq!(send_to_decoy(&mut h, &tampered).await, tampered);

    // Plain HTTP, shorter than a handshake
    let http = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
    assert_eq!(send_to_decoy(&mut h, &http).await, http);

    // Random bytes longer than a handshake
    let noise = pattern(300, 99);
    assert_eq!(send_to_decoy(&mut h, &noise).await, noise);

    // Stale timestamp
    let stale = HandshakeMessage {
        uid: h.user,
        proxy_method: "echo".to_string(),
        suite: CipherSuite::Plain,
        session_id: 1,
        timestamp: unix_now() - 3600,
    }
    .seal(&h.public)
    .unwrap()
    .0;
    assert_eq!(send_to_decoy(&mut h, &stale).await, stale);

    assert_eq!(h.echo_hits.load(Ordering::SeqCst), 0);
    assert_eq!(h.server.session_count(), 0);
}

/// A short first flight is relayed at once, not held for more bytes
#[tokio::test]
async fn test_short_request_decoyed_without_delay() {
    let decoy = spawn_eager_decoy().await;
    let h = start_server_with(false, 10_000, Some(decoy)).await;

    let mut conn = TcpStream::connect(&h.addr).await.unwrap();
    let started = Instant::now();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut reply = vec![0u8; DECOY_REPLY.len()];
    tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, DECOY_REPLY);
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "decoy answered after {:?}",
        started.elapsed()
    );
}

/// Pooled connections keep their listener slots until they leave the pool
#[tokio::test]
async fn test_pooled_connections_hold_listener_slots() {
    let decoy = spawn_eager_decoy().await;
    let h = start_server_with(false, 2, Some(decoy)).await;
    let manager = manager_for(&h, "echo", CipherSuite::ChaCha20Poly1305, 2);

    let mut stream = manager.open_stream().await.unwrap();
    stream.write(b"up").await.unwrap();
    assert_eq!(read_len(&mut stream, 2).await, b"up");

    // Both slots are taken by the session, so this one is not served
    let mut extra = TcpStream::connect(&h.addr).await.unwrap();
    extra.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut reply = vec![0u8; DECOY_REPLY.len()];
    assert!(
        tokio::time::timeout(Duration::from_millis(300), extra.read_exact(&mut reply))
            .await
            .is_err()
    );

    manager.close().await;
    tokio::time::timeout(Duration::from_secs(5), extra.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, DECOY_REPLY);
}

/// A captured handshake replayed later goes to the decoy
#[tokio::test]
async fn test_replayed_handshake_reaches_decoy() {
    let mut h = start_server(false).await;
    let wire = sealed_hello(&h, h.user);

    let mut first = TcpStream::connect(&h.addr).await.unwrap();
    first.write_all(&wire).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.server.session_count(), 1);

    assert_eq!(send_to_decoy(&mut h, &wire).await, wire);
    drop(first);
}

/// A dead backend fails its streams but not the session
#[tokio::test]
async fn test_backend_failure_is_stream_local() {
    let h = start_server(false).await;
    let manager = manager_for(&h, "dead", CipherSuite::ChaCha20Poly1305, 2);

    let session = manager.session().await.unwrap();
    for _ in 0..3 {
        let mut stream = manager.open_stream().await.unwrap();
        expect_eof(&mut stream).await;
    }

    assert!(!session.is_closed());
    assert!(manager.session().await.unwrap().same_as(&session));
    assert_eq!(h.server.session_count(), 1);
}

/// Administrative identifiers are routed to the control backend
#[tokio::test]
async fn test_admin_uses_control_backend() {
    let h = start_server(true).await;
    let manager = SessionManager::new(
        client_settings(&h.addr, &h.public, h.admin, "echo", CipherSuite::Plain, 1),
        Arc::new(TcpDialer::default()),
    );

    let mut stream = manager.open_stream().await.unwrap();
    assert_eq!(read_len(&mut stream, CONTROL_GREETING.len()).await, CONTROL_GREETING);
    assert_eq!(h.echo_hits.load(Ordering::SeqCst), 0);
}

/// Without a control backend, administrative streams are just closed
#[tokio::test]
async fn test_admin_without_control_backend() {
    let h = start_server(false).await;
    let manager = SessionManager::new(
        client_settings(&h.addr, &h.public, h.admin, "echo", CipherSuite::Plain, 1),
        Arc::new(TcpDialer::default()),
    );

    let mut stream = manager.open_stream().await.unwrap();
    expect_eof(&mut stream).await;
    assert!(!manager.session().await.unwrap().is_closed());
}

/// TCP relay in front of the server whose live connections can be cut
struct Relay {
    addr: String,
    live: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Relay {
    async fn start(target: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let live = Arc::new(Mutex::new(Vec::new()));
        let handles = Arc::clone(&live);

        tokio::spawn(async move {
            loop {
                let (mut inbound, _) = listener.accept().await.unwrap();
                let target = target.clone();
                let task = tokio::spawn(async move {
                    let mut outbound = TcpStream::connect(&target).await.unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                });
                handles.lock().unwrap().push(task.abort_handle());
            }
        });
        Self { addr, live }
    }

    fn cut(&self) {
        for task in self.live.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Losing every raw connection closes streams and the next open rebuilds
#[tokio::test]
async fn test_session_rebuild_after_pool_loss() {
    let h = start_server(false).await;
    let relay = Relay::start(h.addr.clone()).await;
    let manager = SessionManager::new(
        client_settings(&relay.addr, &h.public, h.user, "echo", CipherSuite::ChaCha20Poly1305, 3),
        Arc::new(TcpDialer::default()),
    );

    let mut before = manager.open_stream().await.unwrap();
    before.write(b"first").await.unwrap();
    assert_eq!(read_len(&mut before, 5).await, b"first");
    let old_session = manager.session().await.unwrap();
    // Every pooled connection must be relayed before it can be cut
    tokio::time::sleep(Duration::from_millis(200)).await;

    relay.cut();
    tokio::time::timeout(Duration::from_secs(5), old_session.closed())
        .await
        .unwrap();
    // Pool loss looks like an ordinary close to the stream
    expect_eof(&mut before).await;

    let mut after = manager.open_stream().await.unwrap();
    after.write(b"second").await.unwrap();
    assert_eq!(read_len(&mut after, 6).await, b"second");

    let new_session = manager.session().await.unwrap();
    assert!(!new_session.same_as(&old_session));
    assert_eq!(new_session.connection_count(), 3);
}
