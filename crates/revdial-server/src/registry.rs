//! Registry of live sessions by client key

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use revdial_core::{ClientKey, Session};

/// Live sessions indexed by client key.
///
/// One agent may hold several sessions at once (for example while a
/// reconnect overlaps the old socket), so each key maps to a list in
/// registration order.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ClientKey, Vec<Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under `key`
    pub fn add(&self, key: ClientKey, session: Arc<Session>) {
        tracing::debug!("Registering session for {}", key);
        self.sessions.entry(key).or_default().push(session);
    }

    /// Remove exactly this session. Returns whether it was registered.
    pub fn remove(&self, key: &ClientKey, session: &Arc<Session>) -> bool {
        let Entry::Occupied(mut entry) = self.sessions.entry(key.clone()) else {
            return false;
        };

        let list = entry.get_mut();
        let before = list.len();
        list.retain(|s| !Arc::ptr_eq(s, session));
        let removed = list.len() != before;

        if list.is_empty() {
            entry.remove();
        }
        if removed {
            tracing::debug!("Removed session for {}", key);
        }
        removed
    }

    /// Whether any session is registered for `key`
    pub fn has_session(&self, key: &ClientKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Sessions of `key`, oldest first
    pub fn sessions_for(&self, key: &ClientKey) -> Vec<Arc<Session>> {
        self.sessions
            .get(key)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Keys with at least one session, sorted
    pub fn list_clients(&self) -> Vec<ClientKey> {
        let mut keys: Vec<ClientKey> = self.sessions.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of connected client keys
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total number of sessions across all keys
    pub fn session_count(&self) -> usize {
        self.sessions.iter().map(|r| r.value().len()).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use revdial_core::config::SessionConfig;
    use revdial_core::NoopMetrics;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    /// A server session that is never served, plus the raw peer end
    pub(crate) async fn idle_session_with_peer(key: &str) -> (Arc<Session>, DuplexStream) {
        let (a, peer) = tokio::io::duplex(64 * 1024);
        let ws = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let session = Session::new_server(
            ClientKey::from(key),
            ws,
            SessionConfig::default(),
            Arc::new(NoopMetrics),
        );
        (session, peer)
    }

    pub(crate) async fn idle_session(key: &str) -> Arc<Session> {
        idle_session_with_peer(key).await.0
    }

    #[tokio::test]
    async fn test_add_and_remove_exact_session() {
        let registry = SessionRegistry::new();
        let key = ClientKey::from("agent1");
        let first = idle_session("agent1").await;
        let second = idle_session("agent1").await;

        registry.add(key.clone(), Arc::clone(&first));
        registry.add(key.clone(), Arc::clone(&second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.session_count(), 2);

        assert!(registry.remove(&key, &first));
        assert!(!registry.remove(&key, &first));
        assert!(registry.has_session(&key));
        assert!(Arc::ptr_eq(&registry.sessions_for(&key)[0], &second));

        assert!(registry.remove(&key, &second));
        assert!(!registry.has_session(&key));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_list_clients_sorted() {
        let registry = SessionRegistry::new();
        for key in ["zeta", "alpha", "mid"] {
            registry.add(ClientKey::from(key), idle_session(key).await);
        }

        let keys: Vec<String> = registry
            .list_clients()
            .into_iter()
            .map(|k| k.0)
            .collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
        assert!(registry.sessions_for(&ClientKey::from("missing")).is_empty());
    }
}
