//! Metrics sink implementations

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::traits::MetricsSink;

/// Discards every counter
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Process-local atomic counters, aggregated over all client keys
#[derive(Debug, Default)]
pub struct CounterMetrics {
    sessions_added: AtomicU64,
    sessions_removed: AtomicU64,
    connections_added: AtomicU64,
    connections_removed: AtomicU64,
    bytes_transmitted: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_added: u64,
    pub sessions_removed: u64,
    pub connections_added: u64,
    pub connections_removed: u64,
    pub bytes_transmitted: u64,
    pub bytes_received: u64,
    pub errors: u64,
}

impl MetricsSnapshot {
    /// Sessions currently alive
    pub fn active_sessions(&self) -> u64 {
        self.sessions_added.saturating_sub(self.sessions_removed)
    }

    /// Connections currently alive
    pub fn active_connections(&self) -> u64 {
        self.connections_added
            .saturating_sub(self.connections_removed)
    }
}

impl CounterMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_added: self.sessions_added.load(Ordering::Relaxed),
            sessions_removed: self.sessions_removed.load(Ordering::Relaxed),
            connections_added: self.connections_added.load(Ordering::Relaxed),
            connections_removed: self.connections_removed.load(Ordering::Relaxed),
            bytes_transmitted: self.bytes_transmitted.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for CounterMetrics {
    fn add_session(&self, _client_key: &str) {
        self.sessions_added.fetch_add(1, Ordering::Relaxed);
    }

    fn remove_session(&self, _client_key: &str) {
        self.sessions_removed.fetch_add(1, Ordering::Relaxed);
    }

    fn add_connection(&self, _client_key: &str, _proto: &str, _address: &str) {
        self.connections_added.fetch_add(1, Ordering::Relaxed);
    }

    fn remove_connection(&self, _client_key: &str, _proto: &str, _address: &str) {
        self.connections_removed.fetch_add(1, Ordering::Relaxed);
    }

    fn bytes_transmitted(&self, _client_key: &str, bytes: usize) {
        self.bytes_transmitted
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn bytes_received(&self, _client_key: &str, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn error(&self, _client_key: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}
