//! Shadowmux Client
//!
//! Listens locally and carries every accepted connection as a stream over a
//! pooled, encrypted session to the server.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use shadowmux::{
    client::route_tcp,
    config::Config,
    protocol::Uid,
    transport::{TcpDialer, TransportConfig},
    SessionManager,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shadowmux Client - probe-resistant multiplexing tunnel
#[derive(Parser, Debug)]
#[command(name = "shadowmux-client")]
#[command(about = "Shadowmux Client - probe-resistant multiplexing tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Generate a new user identifier and exit
    #[arg(long)]
    generate_uid: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_uid {
        println!("{}", Uid::generate());
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(level).init();

    let client_config = config
        .client
        .as_ref()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    let mut settings = client_config
        .to_settings()
        .context("Invalid client configuration")?;
    if let Some(server) = args.server {
        settings.server = server;
    }
    if let Some(listen) = args.listen {
        settings.local_listen = listen;
    }

    info!("Shadowmux Client v{}", shadowmux::VERSION);
    info!("Server: {}", settings.server);
    info!(
        "Method '{}', {}, pool size {}",
        settings.proxy_method, settings.suite, settings.session.pool_size
    );

    let listener = TcpListener::bind(&settings.local_listen)
        .await
        .with_context(|| format!("Failed to bind {}", settings.local_listen))?;
    info!("Listening on {}", settings.local_listen);

    let dialer = Arc::new(TcpDialer::new(TransportConfig::default()));
    let manager = Arc::new(SessionManager::new(settings, dialer));

    // Handshake eagerly so configuration errors show up at startup
    if let Err(e) = manager.session().await {
        error!("Initial session failed: {} (will retry on first connection)", e);
    }

    tokio::select! {
        result = route_tcp(listener, Arc::clone(&manager)) => {
            if let Err(e) = result {
                error!("Local listener stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    manager.close().await;
    Ok(())
}
