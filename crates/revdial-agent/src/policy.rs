//! Egress policy for dial requests

use std::collections::HashSet;

use revdial_core::config::EgressConfig;
use revdial_core::ConnectAuthorizer;

/// Which addresses the server may ask this agent to dial.
///
/// TCP is allowed wholesale (unless disabled); unix sockets only when the
/// exact path is listed.
#[derive(Debug, Clone)]
pub struct EgressPolicy {
    allow_tcp: bool,
    unix_sockets: HashSet<String>,
}

impl EgressPolicy {
    /// Build the policy from configuration
    pub fn new(config: &EgressConfig) -> Self {
        Self {
            allow_tcp: config.allow_tcp,
            unix_sockets: config.unix_sockets.iter().cloned().collect(),
        }
    }

    /// Whether a dial of `address` over `proto` is allowed
    pub fn allows(&self, proto: &str, address: &str) -> bool {
        match proto {
            "tcp" | "tcp4" | "tcp6" => self.allow_tcp,
            "unix" => self.unix_sockets.contains(address),
            _ => false,
        }
    }
}

impl Default for EgressPolicy {
    fn default() -> Self {
        Self::new(&EgressConfig::default())
    }
}

impl From<&EgressConfig> for EgressPolicy {
    fn from(config: &EgressConfig) -> Self {
        Self::new(config)
    }
}

impl ConnectAuthorizer for EgressPolicy {
    fn authorize(&self, proto: &str, address: &str) -> bool {
        let allowed = self.allows(proto, address);
        if !allowed {
            tracing::warn!("Egress policy refused {}://{}", proto, address);
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_tcp_only() {
        let policy = EgressPolicy::default();
        assert!(policy.allows("tcp", "10.0.0.5:80"));
        assert!(policy.allows("tcp6", "[::1]:443"));
        assert!(!policy.allows("unix", "/var/run/docker.sock"));
        assert!(!policy.allows("udp", "10.0.0.5:53"));
    }

    #[test]
    fn test_listed_unix_socket() {
        let policy = EgressPolicy::new(&EgressConfig {
            allow_tcp: false,
            unix_sockets: vec!["/var/run/docker.sock".to_string()],
        });
        assert!(policy.authorize("unix", "/var/run/docker.sock"));
        assert!(!policy.authorize("unix", "/var/run/other.sock"));
        assert!(!policy.authorize("tcp", "10.0.0.5:80"));
    }
}
