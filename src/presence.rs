//! Presence query surface
//!
//! A read-mostly projection of the hub's user index: per-user connection
//! counts behind a reader-writer lock. Anyone may read it from any task;
//! only the hub's register/unregister paths write to it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::UserId;

/// Cloneable handle onto the presence projection
#[derive(Debug, Clone, Default)]
pub struct Presence {
    counts: Arc<RwLock<HashMap<UserId, usize>>>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the user has at least one active connection
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.counts.read().contains_key(&user_id)
    }

    /// Ids of every user with at least one active connection
    pub fn online_user_ids(&self) -> BTreeSet<UserId> {
        self.counts.read().keys().copied().collect()
    }

    /// Number of active connections the user has (0 when offline)
    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.counts.read().get(&user_id).copied().unwrap_or(0)
    }

    /// Record the user's current connection count; zero removes the user
    pub(crate) fn set(&self, user_id: UserId, count: usize) {
        let mut counts = self.counts.write();
        if count == 0 {
            counts.remove(&user_id);
        } else {
            counts.insert(user_id, count);
        }
    }
}
