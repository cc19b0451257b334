//! # Shadowmux
//!
//! A covert stream-multiplexing transport. Many logical TCP streams are
//! carried over a small pool of encrypted raw connections, and anything that
//! fails the admission handshake is silently relayed to an unrelated decoy
//! server, so an active prober only ever sees the decoy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Routing Layer                      │
//! │   (client local listener, server proxy router)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Session Layer                       │
//! │   (stream table, reordering, round-robin dispatch)  │
//! ├─────────────────────────────────────────────────────┤
//! │                   Record Layer                       │
//! │   (frame codec, per-direction AEAD, keepalives)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Admission Layer                      │
//! │      (Noise N handshake, allow-list, decoy)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                 (raw TCP pool)                       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use client::SessionManager;
pub use config::Config;
pub use server::Server;
pub use tunnel::{Session, Stream};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
