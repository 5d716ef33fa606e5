//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handshake header carrying the agent's requested identity
pub const CLIENT_KEY_HEADER: &str = "X-Tunnel-ID";

/// Handshake header carrying the shared secret
pub const TOKEN_HEADER: &str = "X-API-Tunnel-Token";

/// Identity assigned to an agent at handshake time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientKey(pub String);

impl ClientKey {
    /// Create a new client key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the raw key string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Network address of a tunneled connection, as named in the dial request.
///
/// Reported as both the local and the remote address of a
/// [`TunnelStream`](crate::TunnelStream).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelAddr {
    /// Network, e.g. `tcp` or `unix`
    pub proto: String,
    /// Address string for that network
    pub address: String,
}

impl TunnelAddr {
    /// Create a new tunnel address
    pub fn new(proto: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            proto: proto.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proto, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_key_conversions() {
        let a = ClientKey::from("agent1");
        let b = ClientKey::new(String::from("agent1"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "agent1");
        assert_eq!(a.to_string(), "agent1");
    }

    #[test]
    fn test_tunnel_addr_display() {
        let addr = TunnelAddr::new("tcp", "10.0.0.5:80");
        assert_eq!(addr.to_string(), "tcp://10.0.0.5:80");
    }
}
