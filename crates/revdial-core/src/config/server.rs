//! Server configuration

use serde::{Deserialize, Serialize};

use super::SessionConfig;

/// Configuration for the tunnel server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_address: String,

    /// Request path agents connect to
    pub path: String,

    /// Shared secrets accepted in the token header. Empty accepts any agent.
    pub tokens: Vec<String>,

    /// How a session is picked when a client key has several
    pub selection: SelectionStrategy,

    /// Local TCP forwards served through agents (debug tooling)
    pub forwards: Vec<ForwardConfig>,

    /// Session tuning
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8123".to_string(),
            path: "/connect".to_string(),
            tokens: vec![],
            selection: SelectionStrategy::default(),
            forwards: vec![],
            session: SessionConfig::default(),
        }
    }
}

/// Session selection policy among several sessions of one client key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Oldest registered session
    First,
    /// Uniformly random session
    #[default]
    Random,
    /// Rotate through sessions
    RoundRobin,
}

/// A local listener whose connections are dialed through an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Local address to listen on
    pub listen: String,

    /// Client key to dial through; a random connected client when unset
    #[serde(default)]
    pub client: Option<String>,

    /// Network the agent dials
    #[serde(default = "default_proto")]
    pub proto: String,

    /// Address the agent dials
    pub target: String,
}

fn default_proto() -> String {
    "tcp".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_defaults() {
        let forward: ForwardConfig = toml::from_str(
            r#"
listen = "127.0.0.1:6443"
target = "10.0.0.5:443"
"#,
        )
        .unwrap();
        assert_eq!(forward.proto, "tcp");
        assert_eq!(forward.client, None);
    }

    #[test]
    fn test_default_selection_is_random() {
        assert_eq!(ServerConfig::default().selection, SelectionStrategy::Random);
    }
}
