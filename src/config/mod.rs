//! Configuration management
//!
//! The TOML file is parsed into [`Config`] and then validated into the
//! runtime [`ServerSettings`] / [`ClientSettings`] the core consumes.

use crate::crypto::{CipherSuite, PrivateKey, PublicKey};
use crate::protocol::{
    Uid, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT, KEEPALIVE_INTERVAL, METHOD_LEN, STREAM_TIMEOUT,
    TIMESTAMP_WINDOW,
};
use crate::tunnel::{SessionConfig, DEFAULT_POOL_SIZE, DEFAULT_STREAM_BUFFER, MAX_STREAM_WINDOW};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

fn invalid(msg: impl Into<String>) -> crate::Error {
    crate::Error::Config(msg.into())
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Server private key (base64)
    pub private_key: String,
    /// Server public key (base64), stored for convenience
    pub public_key: String,
    /// Allow-listed user identifiers (base64)
    pub users: Vec<String>,
    /// Identifier granting administrative mode (base64)
    pub admin_uid: Option<String>,
    /// Backend for administrative sessions
    pub control_backend: Option<String>,
    /// Proxy method name to backend address
    pub proxy_book: HashMap<String, String>,
    /// Decoy address for connections that fail admission
    pub redirect_addr: String,
    /// Raw connections allowed per session
    pub max_pool_size: usize,
    /// Stream idle timeout in seconds
    pub stream_timeout_secs: u64,
    /// Raw connection idle timeout in seconds
    pub idle_timeout_secs: u64,
    /// Keepalive interval in seconds
    pub keepalive_secs: u64,
    /// Accepted handshake clock skew in seconds
    pub timestamp_window_secs: u64,
    /// Time allowed for the handshake bytes to arrive
    pub handshake_timeout_secs: u64,
    /// Per-stream send window in bytes
    pub stream_buffer_limit: usize,
    /// Maximum concurrent raw connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:443".to_string(),
            private_key: String::new(),
            public_key: String::new(),
            users: Vec::new(),
            admin_uid: None,
            control_backend: None,
            proxy_book: HashMap::new(),
            redirect_addr: "www.example.com:443".to_string(),
            max_pool_size: DEFAULT_POOL_SIZE,
            stream_timeout_secs: STREAM_TIMEOUT,
            idle_timeout_secs: IDLE_TIMEOUT,
            keepalive_secs: KEEPALIVE_INTERVAL,
            timestamp_window_secs: TIMESTAMP_WINDOW,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT,
            stream_buffer_limit: DEFAULT_STREAM_BUFFER,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Validate and convert into runtime settings
    pub fn to_settings(&self) -> Result<ServerSettings, crate::Error> {
        if self.private_key.is_empty() {
            return Err(invalid("Server private_key not configured"));
        }
        let private_key = PrivateKey::from_base64(&self.private_key)?;

        if self.redirect_addr.is_empty() {
            return Err(invalid("Server redirect_addr not configured"));
        }
        if self.max_pool_size == 0 {
            return Err(invalid("max_pool_size must be at least 1"));
        }
        check_stream_buffer(self.stream_buffer_limit)?;
        if self.max_connections == 0 {
            return Err(invalid("max_connections must be at least 1"));
        }
        for method in self.proxy_book.keys() {
            if method.len() > METHOD_LEN {
                return Err(invalid(format!(
                    "Proxy method '{}' longer than {} bytes",
                    method, METHOD_LEN
                )));
            }
        }

        let users = self
            .users
            .iter()
            .map(|u| Uid::from_base64(u))
            .collect::<Result<HashSet<_>, _>>()?;
        let admin_uid = self
            .admin_uid
            .as_deref()
            .map(Uid::from_base64)
            .transpose()?;

        Ok(ServerSettings {
            listen: self.listen.clone(),
            private_key,
            users,
            admin_uid,
            control_backend: self.control_backend.clone(),
            proxy_book: self.proxy_book.clone(),
            redirect_addr: self.redirect_addr.clone(),
            session: SessionConfig {
                pool_size: self.max_pool_size,
                keepalive_interval: Duration::from_secs(self.keepalive_secs.max(1)),
                idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
                stream_buffer_limit: self.stream_buffer_limit,
                ..SessionConfig::default()
            },
            stream_timeout: Duration::from_secs(self.stream_timeout_secs.max(1)),
            timestamp_window: self.timestamp_window_secs,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            connect_timeout: Duration::from_secs(10),
            max_connections: self.max_connections,
        })
    }
}

/// Validated server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub private_key: PrivateKey,
    pub users: HashSet<Uid>,
    pub admin_uid: Option<Uid>,
    pub control_backend: Option<String>,
    pub proxy_book: HashMap<String, String>,
    pub redirect_addr: String,
    pub session: SessionConfig,
    pub stream_timeout: Duration,
    /// Accepted clock skew in seconds
    pub timestamp_window: u64,
    pub handshake_timeout: Duration,
    /// Backend and decoy dial timeout
    pub connect_timeout: Duration,
    pub max_connections: usize,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// Server public key (base64)
    pub server_public_key: String,
    /// Our user identifier (base64)
    pub uid: String,
    /// Proxy method requested from the server
    pub proxy_method: String,
    /// Cipher suite: plain, aes-gcm or chacha20-poly1305
    pub encryption: String,
    /// Raw connections per session
    pub pool_size: usize,
    /// Local address accepting application connections
    pub local_listen: String,
    /// Stream idle timeout in seconds
    pub stream_timeout_secs: u64,
    /// Raw connection idle timeout in seconds
    pub idle_timeout_secs: u64,
    /// Keepalive interval in seconds
    pub keepalive_secs: u64,
    /// Per-stream send window in bytes
    pub stream_buffer_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:443".to_string(),
            server_public_key: String::new(),
            uid: String::new(),
            proxy_method: "shadowsocks".to_string(),
            encryption: CipherSuite::ChaCha20Poly1305.name().to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            local_listen: "127.0.0.1:1984".to_string(),
            stream_timeout_secs: STREAM_TIMEOUT,
            idle_timeout_secs: IDLE_TIMEOUT,
            keepalive_secs: KEEPALIVE_INTERVAL,
            stream_buffer_limit: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl ClientConfig {
    /// Validate and convert into runtime settings
    pub fn to_settings(&self) -> Result<ClientSettings, crate::Error> {
        if self.server_public_key.is_empty() {
            return Err(invalid("Client server_public_key not configured"));
        }
        if self.uid.is_empty() {
            return Err(invalid("Client uid not configured"));
        }
        if self.proxy_method.len() > METHOD_LEN {
            return Err(invalid(format!(
                "Proxy method '{}' longer than {} bytes",
                self.proxy_method, METHOD_LEN
            )));
        }
        if self.pool_size == 0 {
            return Err(invalid("pool_size must be at least 1"));
        }
        check_stream_buffer(self.stream_buffer_limit)?;

        Ok(ClientSettings {
            server: self.server.clone(),
            server_public_key: PublicKey::from_base64(&self.server_public_key)?,
            uid: Uid::from_base64(&self.uid)?,
            proxy_method: self.proxy_method.clone(),
            suite: self.encryption.parse()?,
            local_listen: self.local_listen.clone(),
            session: SessionConfig {
                pool_size: self.pool_size,
                keepalive_interval: Duration::from_secs(self.keepalive_secs.max(1)),
                idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
                stream_buffer_limit: self.stream_buffer_limit,
                ..SessionConfig::default()
            },
            stream_timeout: Duration::from_secs(self.stream_timeout_secs.max(1)),
        })
    }
}

/// Validated client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server: String,
    pub server_public_key: PublicKey,
    pub uid: Uid,
    pub proxy_method: String,
    pub suite: CipherSuite,
    pub local_listen: String,
    /// Session tuning; `pool_size` is the number of raw connections dialed
    pub session: SessionConfig,
    pub stream_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    let mut server = ServerConfig::default();
    server
        .proxy_book
        .insert("shadowsocks".to_string(), "127.0.0.1:8388".to_string());

    Config {
        server: Some(server),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}

fn check_stream_buffer(limit: usize) -> crate::Result<()> {
    if limit == 0 || limit > MAX_STREAM_WINDOW {
        return Err(invalid(format!(
            "stream_buffer_limit must be between 1 and {}",
            MAX_STREAM_WINDOW
        )));
    }
    Ok(())
}
