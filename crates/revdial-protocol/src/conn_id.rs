//! Logical connection identifier

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one logical connection multiplexed inside a session.
///
/// Ids are allocated by the side that originates the dial. Server-role
/// sessions hand out odd ids and client-role sessions even ids, so the two
/// directions of one session never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for ConnId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
