//! History bridge
//!
//! The hub never talks to storage itself. Whoever owns persisted private
//! messages hands the hub a `HistoryBridge` at construction time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HistoryError;
use crate::types::UserId;

/// One persisted private message, as returned by the history collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// Source of past private messages between two users
pub trait HistoryBridge: Send + Sync {
    /// Load up to `limit` messages exchanged by `user_id` and `other_user_id`,
    /// skipping the first `offset`, ordered as the collaborator stores them.
    fn load(
        &self,
        user_id: UserId,
        other_user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<HistoryEntry>, HistoryError>;
}

impl<F> HistoryBridge for F
where
    F: Fn(UserId, UserId, u32, u32) -> Result<Vec<HistoryEntry>, HistoryError> + Send + Sync,
{
    fn load(
        &self,
        user_id: UserId,
        other_user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        self(user_id, other_user_id, limit, offset)
    }
}

/// Bridge used when no history collaborator is wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyHistory;

impl HistoryBridge for EmptyHistory {
    fn load(&self, _: UserId, _: UserId, _: u32, _: u32) -> Result<Vec<HistoryEntry>, HistoryError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_history() {
        let page = EmptyHistory.load(UserId(1), UserId(2), 50, 0).unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn test_closure_bridge() {
        let bridge = |user: UserId,
                      other: UserId,
                      limit: u32,
                      offset: u32|
         -> Result<Vec<HistoryEntry>, HistoryError> {
            assert_eq!((user, other, limit, offset), (UserId(1), UserId(2), 50, 10));
            Err(HistoryError::Query("boom".to_string()))
        };
        assert!(bridge.load(UserId(1), UserId(2), 50, 10).is_err());
    }
}
