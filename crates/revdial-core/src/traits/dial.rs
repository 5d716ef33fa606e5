//! Dial request traits

use async_trait::async_trait;

use crate::session::TunnelStream;

/// Decides whether a dial request from the peer may be honoured.
///
/// Consulted by the session before any connection is created, so the
/// peer cannot force arbitrary egress.
pub trait ConnectAuthorizer: Send + Sync {
    /// Return true to allow dialing `address` over `proto`
    fn authorize(&self, proto: &str, address: &str) -> bool;
}

impl<F> ConnectAuthorizer for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn authorize(&self, proto: &str, address: &str) -> bool {
        self(proto, address)
    }
}

/// Authorizer that accepts every dial request
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConnectAuthorizer for AllowAll {
    fn authorize(&self, _proto: &str, _address: &str) -> bool {
        true
    }
}

/// Receives connections created by an authorized dial request.
///
/// Runs on its own task; the demux loop never waits for it.
#[async_trait]
pub trait DialRequestHandler: Send + Sync {
    /// Serve the tunneled connection. The requested address is
    /// `stream.remote_addr()`.
    async fn handle(&self, stream: TunnelStream);
}
