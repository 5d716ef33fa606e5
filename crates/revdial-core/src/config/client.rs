//! Agent configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::SessionConfig;
use crate::types::{CLIENT_KEY_HEADER, TOKEN_HEADER};

/// Configuration for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the server, `ws://` or `wss://`
    pub server_url: String,

    /// Identity requested at handshake
    pub client_id: String,

    /// Shared secret sent in the token header
    pub token: Option<String>,

    /// Extra handshake headers
    pub headers: BTreeMap<String, String>,

    /// Bound on each real outbound dial
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// Pause after a failed or ended connection before the caller retries
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,

    /// Which dial requests the agent honours
    pub egress: EgressConfig,

    /// Session tuning
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8123/connect".to_string(),
            client_id: "agent".to_string(),
            token: None,
            headers: BTreeMap::new(),
            dial_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            egress: EgressConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Headers sent with the WebSocket upgrade request
    pub fn handshake_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![(CLIENT_KEY_HEADER.to_string(), self.client_id.clone())];
        if let Some(token) = &self.token {
            headers.push((TOKEN_HEADER.to_string(), token.clone()));
        }
        headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers
    }
}

/// Egress policy: what the server may ask this agent to dial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Allow any `tcp` address
    pub allow_tcp: bool,

    /// Unix socket paths that may be dialed
    pub unix_sockets: Vec<String>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            allow_tcp: true,
            unix_sockets: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_headers() {
        let mut config = ClientConfig::default();
        config.client_id = "agent1".to_string();
        config.token = Some("s3cret".to_string());
        config
            .headers
            .insert("X-Cluster".to_string(), "c-123".to_string());

        let headers = config.handshake_headers();
        assert_eq!(
            headers,
            vec![
                (CLIENT_KEY_HEADER.to_string(), "agent1".to_string()),
                (TOKEN_HEADER.to_string(), "s3cret".to_string()),
                ("X-Cluster".to_string(), "c-123".to_string()),
            ]
        );
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.dial_timeout, Duration::from_secs(60));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert!(config.egress.allow_tcp);
    }
}
