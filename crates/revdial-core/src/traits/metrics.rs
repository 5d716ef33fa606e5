//! Metrics sink

/// Receives counters from sessions.
///
/// Injected at session construction so that each server or agent instance
/// reports independently. Every method defaults to a no-op.
pub trait MetricsSink: Send + Sync {
    /// A session became active
    fn add_session(&self, _client_key: &str) {}

    /// A session was torn down
    fn remove_session(&self, _client_key: &str) {}

    /// A logical connection was registered
    fn add_connection(&self, _client_key: &str, _proto: &str, _address: &str) {}

    /// A logical connection was removed
    fn remove_connection(&self, _client_key: &str, _proto: &str, _address: &str) {}

    /// Bytes written to the socket
    fn bytes_transmitted(&self, _client_key: &str, _bytes: usize) {}

    /// Bytes read from the socket
    fn bytes_received(&self, _client_key: &str, _bytes: usize) {}

    /// A session failed with an error
    fn error(&self, _client_key: &str) {}
}
