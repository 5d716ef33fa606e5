//! Configuration management for revdial

mod client;
mod server;
mod session;
pub mod serde_utils;

pub use client::{ClientConfig, EgressConfig};
pub use server::{ForwardConfig, SelectionStrategy, ServerConfig};
pub use session::{SessionConfig, DEFAULT_READ_BUFFER_SIZE};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("revdial")
}

/// Get the default path for a named configuration file (`server`, `agent`)
pub fn default_config_path(name: &str) -> PathBuf {
    default_config_dir().join(format!("{}.toml", name))
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.toml");

        let mut config = ClientConfig::default();
        config.client_id = "agent1".to_string();
        config.reconnect_delay = Duration::from_secs(9);
        config.egress.unix_sockets = vec!["/var/run/docker.sock".to_string()];

        save_config(&path, &config).unwrap();
        let loaded: ClientConfig = load_config(&path).unwrap();

        assert_eq!(loaded.client_id, "agent1");
        assert_eq!(loaded.reconnect_delay, Duration::from_secs(9));
        assert_eq!(loaded.egress.unix_sockets, config.egress.unix_sockets);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<ServerConfig, _> = load_config(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
bind_address = "127.0.0.1:9000"
selection = "round_robin"

[session]
ping_wait = 30
"#,
        )
        .unwrap();

        let config: ServerConfig = load_config(&path).unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.selection, SelectionStrategy::RoundRobin);
        assert_eq!(config.session.ping_wait, Duration::from_secs(30));
        assert_eq!(
            config.session.ping_write_interval,
            SessionConfig::default().ping_write_interval
        );
    }

    #[test]
    fn test_loaded_session_settings_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "[session]\nping_write_interval = 10\nping_wait = 2\n").unwrap();

        let config: ClientConfig = load_config(&path).unwrap();
        assert!(matches!(
            config.session.validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_default_config_path_names_file() {
        let path = default_config_path("agent");
        assert!(path.ends_with("revdial/agent.toml"));
    }
}
