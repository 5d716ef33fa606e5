//! revdial agent daemon
//!
//! Keeps one outbound WebSocket open to the server and dials local
//! addresses when the server asks, within the configured egress policy.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use revdial_agent::{ClientConnector, ClientError};
use revdial_core::config::{self, ClientConfig};

#[derive(Parser)]
#[command(name = "revdial-agent")]
#[command(about = "revdial agent - dials on behalf of the server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server WebSocket URL (e.g. ws://tunnel.example.com:8123/connect)
    #[arg(short, long)]
    server_url: Option<String>,

    /// Identity to request from the server
    #[arg(long)]
    client_id: Option<String>,

    /// Shared secret for the server
    #[arg(short, long, env = "REVDIAL_TOKEN")]
    token: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("revdial agent starting...");

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_path("agent"));

    let mut config: ClientConfig = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        tracing::info!("Using default configuration");
        ClientConfig::default()
    };

    // Apply command-line overrides
    if let Some(url) = args.server_url {
        config.server_url = url;
    }
    if let Some(client_id) = args.client_id {
        config.client_id = client_id;
    }
    if args.token.is_some() {
        config.token = args.token;
    }
    config
        .session
        .validate()
        .context("Invalid session settings")?;

    if config.egress.allow_tcp {
        tracing::info!("Egress: tcp allowed");
    }
    for path in &config.egress.unix_sockets {
        tracing::info!("Egress: unix socket {}", path);
    }

    let connector = ClientConnector::from_config(&config);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // Main loop with reconnection
    while !cancel.is_cancelled() {
        match connector.connect(cancel.clone()).await {
            Ok(()) => {}
            Err(ClientError::InvalidUrl { url, source }) => {
                anyhow::bail!("Invalid server URL {}: {}", url, source);
            }
            Err(ClientError::InvalidHeader(name)) => {
                anyhow::bail!("Invalid handshake header {}", name);
            }
            Err(e) => {
                tracing::info!("Reconnecting after: {}", e);
            }
        }
    }

    tracing::info!("Agent shutdown complete");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
