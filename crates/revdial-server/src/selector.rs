//! Choosing among several sessions of one client

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use revdial_core::config::SelectionStrategy;
use revdial_core::Session;

/// Picks the session a dial goes through
pub trait PeerSelector: Send + Sync {
    /// Choose one of `sessions`, or `None` if the slice is empty
    fn select(&self, sessions: &[Arc<Session>]) -> Option<Arc<Session>>;
}

/// Always the oldest session
#[derive(Debug, Default)]
pub struct First;

impl PeerSelector for First {
    fn select(&self, sessions: &[Arc<Session>]) -> Option<Arc<Session>> {
        sessions.first().cloned()
    }
}

/// Uniformly random session
#[derive(Debug, Default)]
pub struct Random;

impl PeerSelector for Random {
    fn select(&self, sessions: &[Arc<Session>]) -> Option<Arc<Session>> {
        sessions.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Rotates through sessions on successive dials
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl PeerSelector for RoundRobin {
    fn select(&self, sessions: &[Arc<Session>]) -> Option<Arc<Session>> {
        if sessions.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % sessions.len();
        Some(Arc::clone(&sessions[index]))
    }
}

/// Build the selector for a configured strategy
pub fn selector_for(strategy: SelectionStrategy) -> Arc<dyn PeerSelector> {
    match strategy {
        SelectionStrategy::First => Arc::new(First),
        SelectionStrategy::Random => Arc::new(Random),
        SelectionStrategy::RoundRobin => Arc::new(RoundRobin::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::idle_session;

    async fn three_sessions() -> Vec<Arc<Session>> {
        vec![
            idle_session("agent1").await,
            idle_session("agent1").await,
            idle_session("agent1").await,
        ]
    }

    #[tokio::test]
    async fn test_empty_selects_nothing() {
        for strategy in [
            SelectionStrategy::First,
            SelectionStrategy::Random,
            SelectionStrategy::RoundRobin,
        ] {
            assert!(selector_for(strategy).select(&[]).is_none());
        }
    }

    #[tokio::test]
    async fn test_first_is_stable() {
        let sessions = three_sessions().await;
        for _ in 0..5 {
            let chosen = First.select(&sessions).unwrap();
            assert!(Arc::ptr_eq(&chosen, &sessions[0]));
        }
    }

    #[tokio::test]
    async fn test_round_robin_visits_all() {
        let sessions = three_sessions().await;
        let selector = RoundRobin::default();

        for round in 0..2 {
            for (i, expected) in sessions.iter().enumerate() {
                let chosen = selector.select(&sessions).unwrap();
                assert!(Arc::ptr_eq(&chosen, expected), "round {} slot {}", round, i);
            }
        }
    }

    #[tokio::test]
    async fn test_random_picks_a_member() {
        let sessions = three_sessions().await;
        for _ in 0..20 {
            let chosen = Random.select(&sessions).unwrap();
            assert!(sessions.iter().any(|s| Arc::ptr_eq(s, &chosen)));
        }
    }
}
