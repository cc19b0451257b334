//! Shadowmux Server
//!
//! Accepts raw TCP connections and:
//! - Admits clients that present a valid handshake
//! - Relays everything else, byte for byte, to the decoy address
//! - Routes each tunnelled stream to the backend of its proxy method

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use shadowmux::{config::Config, crypto::KeyPair, protocol::Uid, Server};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shadowmux Server - probe-resistant multiplexing tunnel
#[derive(Parser, Debug)]
#[command(name = "shadowmux-server")]
#[command(about = "Shadowmux Server - probe-resistant multiplexing tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Generate new keypair and exit
    #[arg(long)]
    generate_key: bool,

    /// Generate a new user identifier and exit
    #[arg(long)]
    generate_uid: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        return generate_keypair();
    }
    if args.generate_uid {
        println!("{}", Uid::generate());
        return Ok(());
    }

    // Load configuration
    let mut config = Config::load(&args.config).context("Failed to load configuration")?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(level).init();

    let server_config = config
        .server
        .as_mut()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    if server_config.private_key.is_empty() {
        // No keys configured - generate and persist them
        info!("No keypair configured - generating new keypair...");
        let keypair = KeyPair::generate()?;
        server_config.private_key = keypair.private.to_base64();
        server_config.public_key = keypair.public.to_base64();
        info!("Share this public key with clients: {}", keypair.public.to_base64());

        config
            .save(&args.config)
            .context("Failed to save config with new keypair")?;
        info!("Generated and saved new keypair to config file");
    }

    let server_config = config
        .server
        .as_ref()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    let mut settings = server_config
        .to_settings()
        .context("Invalid server configuration")?;
    if let Some(listen) = args.listen {
        settings.listen = listen;
    }

    info!("Shadowmux Server v{}", shadowmux::VERSION);
    info!("Listening on {}", settings.listen);
    info!("Decoy: {}", settings.redirect_addr);
    info!(
        "{} users, {} proxy methods, pool size {}",
        settings.users.len(),
        settings.proxy_book.len(),
        settings.session.pool_size
    );
    if !server_config.public_key.is_empty() {
        info!("Server public key: {}", server_config.public_key);
    }

    let listener = TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen))?;
    let server = Server::new(settings);

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

fn generate_keypair() -> Result<()> {
    let keypair = KeyPair::generate()?;

    println!("Shadowmux keypair generated");
    println!();
    println!("Add to your server config.toml:");
    println!("  private_key = \"{}\"", keypair.private.to_base64());
    println!("  public_key = \"{}\"", keypair.public.to_base64());
    println!();
    println!("Share with clients:");
    println!("  server_public_key = \"{}\"", keypair.public.to_base64());

    Ok(())
}
