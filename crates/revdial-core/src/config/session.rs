//! Per-session tuning shared by both ends of a tunnel

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Default capacity of each connection's read buffer (1 MiB)
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1 << 20;

/// Keepalive, write and buffering limits of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often a WebSocket ping is written
    #[serde(with = "duration_secs")]
    pub ping_write_interval: Duration,

    /// How long the session may go without receiving anything before it is
    /// considered dead
    #[serde(with = "duration_secs")]
    pub ping_wait: Duration,

    /// Bound on frames the session sends itself (pings, dial requests
    /// without a deadline) and on closing the socket. Data writes are only
    /// bounded by the connection's own write deadline.
    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,

    /// Capacity of each connection's read buffer in bytes
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_write_interval: Duration::from_secs(5),
            ping_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl SessionConfig {
    /// Reject settings a session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("ping_write_interval", self.ping_write_interval),
            ("ping_wait", self.ping_wait),
            ("write_timeout", self.write_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.ping_wait <= self.ping_write_interval {
            return Err(ConfigError::Invalid(format!(
                "ping_wait ({:?}) must be longer than ping_write_interval ({:?})",
                self.ping_wait, self.ping_write_interval
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_wait_outlasts_ping_interval() {
        let config = SessionConfig::default();
        assert!(config.ping_wait > config.ping_write_interval * 2);
        assert_eq!(config.read_buffer_size, 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let config = SessionConfig {
            ping_write_interval: Duration::ZERO,
            ..SessionConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ping_write_interval"));

        let config = SessionConfig {
            write_timeout: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_ping_wait_not_above_interval() {
        let config = SessionConfig {
            ping_write_interval: Duration::from_secs(5),
            ping_wait: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SessionConfig {
            ping_wait: Duration::from_millis(5_001),
            ..config
        };
        config.validate().unwrap();
    }
}
