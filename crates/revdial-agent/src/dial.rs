//! Executing dial requests on the agent

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use revdial_core::{CloseReason, DialRequestHandler, TunnelStream};

/// A locally dialed byte stream
pub trait LocalStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LocalStream for T {}

/// Performs the real outbound dial
#[async_trait]
pub trait LocalDialer: Send + Sync {
    /// Connect to `address` over `proto`
    async fn dial(&self, proto: &str, address: &str) -> io::Result<Box<dyn LocalStream>>;
}

/// Dials with the operating system: `tcp` everywhere, `unix` on unix
#[derive(Debug, Clone, Copy, Default)]
pub struct NetDialer;

#[async_trait]
impl LocalDialer for NetDialer {
    async fn dial(&self, proto: &str, address: &str) -> io::Result<Box<dyn LocalStream>> {
        match proto {
            "tcp" | "tcp4" | "tcp6" => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            "unix" => Ok(Box::new(tokio::net::UnixStream::connect(address).await?)),
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network {}", other),
            )),
        }
    }
}

/// Handles dial requests from the server: dials locally, then pipes.
///
/// Failures are reported to the server as an error on the connection.
pub struct DialExecutor {
    dialer: Arc<dyn LocalDialer>,
    dial_timeout: Duration,
}

impl DialExecutor {
    /// Executor using the operating system dialer
    pub fn new(dial_timeout: Duration) -> Self {
        Self::with_dialer(Arc::new(NetDialer), dial_timeout)
    }

    /// Executor using a custom dialer
    pub fn with_dialer(dialer: Arc<dyn LocalDialer>, dial_timeout: Duration) -> Self {
        Self {
            dialer,
            dial_timeout,
        }
    }
}

#[async_trait]
impl DialRequestHandler for DialExecutor {
    async fn handle(&self, stream: TunnelStream) {
        let addr = stream.remote_addr().clone();
        tracing::debug!("{} dialing {}", stream.conn_id(), addr);

        let dialed = tokio::time::timeout(
            self.dial_timeout,
            self.dialer.dial(&addr.proto, &addr.address),
        )
        .await;

        let local = match dialed {
            Ok(Ok(local)) => local,
            Ok(Err(e)) => {
                let err = io::Error::new(
                    e.kind(),
                    format!("dial {} {}: {}", addr.proto, addr.address, e),
                );
                tracing::warn!("{}", err);
                stream.close_with(CloseReason::from_io(&err)).await;
                return;
            }
            Err(_) => {
                let err = io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {} {}: i/o timeout", addr.proto, addr.address),
                );
                tracing::warn!("{}", err);
                stream.close_with(CloseReason::from_io(&err)).await;
                return;
            }
        };

        pipe(stream, local).await;
    }
}

/// Copy bytes both ways until either direction finishes.
///
/// The outcome (EOF or the first error) is sent through the tunnel only
/// after all I/O has stopped, then the local stream is shut down.
pub async fn pipe<L>(tunnel: TunnelStream, local: L)
where
    L: AsyncRead + AsyncWrite + Unpin,
{
    let session = Arc::clone(tunnel.session());
    let id = tunnel.conn_id();

    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let result = tokio::select! {
        r = tokio::io::copy(&mut tunnel_read, &mut local_write) => r,
        r = tokio::io::copy(&mut local_read, &mut tunnel_write) => r,
    };

    let reason = match result {
        Ok(_) => CloseReason::Eof,
        Err(e) => CloseReason::from_io(&e),
    };
    tracing::debug!("{} pipe finished: {}", id, reason);

    session.close_connection(id, reason).await;
    let _ = local_write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_network() {
        let err = match NetDialer.dial("udp", "127.0.0.1:53").await {
            Ok(_) => panic!("udp should not be dialable"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_tcp_dial() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        assert!(NetDialer.dial("tcp", &addr).await.is_ok());
        accept.await.unwrap().unwrap();
    }
}
