//! Local TCP forwarding through an agent
//!
//! Debug tooling: every connection accepted on a local port is dialed
//! through an agent and the bytes are copied both ways.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use revdial_core::config::ForwardConfig;
use revdial_core::ClientKey;

use crate::server::Server;

/// Forwards one local listener to a target reachable by an agent
pub struct Forwarder {
    server: Arc<Server>,
    forward: ForwardConfig,
}

impl Forwarder {
    /// Create a forwarder for one configured forward
    pub fn new(server: Arc<Server>, forward: ForwardConfig) -> Self {
        Self { server, forward }
    }

    /// Bind the configured listen address and forward until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.forward.listen)
            .await
            .with_context(|| format!("Failed to bind forward on {}", self.forward.listen))?;
        self.serve(listener, cancel).await
    }

    /// Forward connections accepted on `listener` until cancelled
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            "Forwarding {} to {}://{} via {}",
            listener.local_addr()?,
            self.forward.proto,
            self.forward.target,
            self.forward.client.as_deref().unwrap_or("any client")
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((socket, peer_addr)) => self.spawn_forward(socket, peer_addr),
                    Err(e) => tracing::error!("Failed to accept forward connection: {}", e),
                },
            }
        }

        Ok(())
    }

    fn spawn_forward(&self, mut socket: TcpStream, peer_addr: SocketAddr) {
        let key = match &self.forward.client {
            Some(client) => Some(ClientKey::from(client.as_str())),
            None => self.server.random_client(),
        };
        let Some(key) = key else {
            tracing::warn!("No agent connected, dropping forward from {}", peer_addr);
            return;
        };

        let dialer = self.server.dialer(key);
        let proto = self.forward.proto.clone();
        let target = self.forward.target.clone();

        tokio::spawn(async move {
            let mut tunnel = match dialer.dial(&proto, &target).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    tracing::warn!("Forward from {} failed: {}", peer_addr, e);
                    return;
                }
            };

            match tokio::io::copy_bidirectional(&mut socket, &mut tunnel).await {
                Ok((up, down)) => tracing::debug!(
                    "Forward from {} done ({} bytes up, {} bytes down)",
                    peer_addr,
                    up,
                    down
                ),
                Err(e) => tracing::debug!("Forward from {} ended: {}", peer_addr, e),
            }
            tunnel.close().await;
        });
    }
}
