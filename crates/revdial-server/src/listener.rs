//! WebSocket listener
//!
//! Accepts TCP connections, performs the upgrade with the server's
//! authorizer, and serves each accepted socket as a session.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

use revdial_core::ClientKey;

use crate::server::Server;

/// Listener that turns upgraded agent connections into sessions
pub struct TunnelListener {
    /// Shared server state
    server: Arc<Server>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

fn error_response(status: StatusCode, message: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message));
    *response.status_mut() = status;
    response
}

impl TunnelListener {
    /// Create a new listener
    pub fn new(server: Arc<Server>, cancel: CancellationToken) -> Self {
        Self { server, cancel }
    }

    /// Bind `bind_addr` and accept until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Accept on an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Tunnel server listening on {} (path {})",
            local_addr,
            self.server.config().path
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Tunnel listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("New connection from {}", peer_addr);

        let server = Arc::clone(&self.server);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut accepted: Option<ClientKey> = None;
            let callback = |req: &Request, response: Response| {
                if req.uri().path() != server.config().path.as_str() {
                    return Err(error_response(
                        StatusCode::NOT_FOUND,
                        format!("no tunnel endpoint at {}", req.uri().path()),
                    ));
                }
                match server.authorizer().authorize(req) {
                    Ok(Some(key)) => {
                        accepted = Some(key);
                        Ok(response)
                    }
                    Ok(None) => Err(error_response(
                        StatusCode::UNAUTHORIZED,
                        "unauthorized".to_string(),
                    )),
                    Err(e) => Err(error_response(StatusCode::UNAUTHORIZED, e.to_string())),
                }
            };

            let ws = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio_tungstenite::accept_hdr_async(socket, callback) => result,
            };

            let ws = match ws {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::warn!("Handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };
            let Some(key) = accepted else {
                return;
            };

            tracing::info!("Agent {} connected from {}", key, peer_addr);
            match server.serve_websocket(key.clone(), ws, cancel).await {
                Ok(()) => tracing::info!("Agent {} from {} disconnected", key, peer_addr),
                Err(e) => {
                    tracing::warn!("Agent {} from {} closed with error: {}", key, peer_addr, e)
                }
            }
        });
    }
}
