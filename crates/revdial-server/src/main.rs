//! revdial server daemon
//!
//! Accepts agent WebSockets and optionally forwards local ports through
//! connected agents.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use revdial_core::config::{self, ServerConfig};
use revdial_core::CounterMetrics;
use revdial_server::{Forwarder, Server, TokenAuthorizer, TunnelListener};

#[derive(Parser)]
#[command(name = "revdial-server")]
#[command(about = "Reverse tunnel server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Accepted agent token (overrides config, repeatable)
    #[arg(short, long, env = "REVDIAL_TOKEN")]
    token: Vec<String>,

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
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("revdial server starting...");

    // Load configuration
    let mut config: ServerConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path("server");
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ServerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if !args.token.is_empty() {
        config.tokens = args.token;
    }
    config
        .session
        .validate()
        .context("Invalid session settings")?;

    let authorizer = TokenAuthorizer::new(config.tokens.clone());
    if authorizer.is_open() {
        tracing::warn!("No tokens configured - any agent may connect");
    }

    let metrics = Arc::new(CounterMetrics::new());
    let bind_addr = config.bind_address.clone();
    let forwards = config.forwards.clone();
    let server = Arc::new(Server::new(Arc::new(authorizer), config, metrics.clone()));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    for forward in forwards {
        let forwarder = Forwarder::new(Arc::clone(&server), forward);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.run(cancel).await {
                tracing::error!("Forward stopped: {:#}", e);
            }
        });
    }

    let listener = TunnelListener::new(Arc::clone(&server), cancel.clone());
    listener.run(&bind_addr).await?;

    let snapshot = metrics.snapshot();
    tracing::info!(
        "Server shutdown complete ({} sessions served, {} connections, {} bytes out, {} bytes in)",
        snapshot.sessions_added,
        snapshot.connections_added,
        snapshot.bytes_transmitted,
        snapshot.bytes_received
    );
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
