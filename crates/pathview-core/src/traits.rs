//! Session identity and the storage trait behind the registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// A live session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque client-held token.
    pub id: SessionId,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created_at: i64,
    /// Timestamp of the last resolved access.
    pub last_access_at: i64,
}

impl Session {
    /// Create a session record stamped at `now`.
    #[must_use]
    pub const fn new(id: SessionId, now: i64) -> Self {
        Self {
            id,
            created_at: now,
            last_access_at: now,
        }
    }

    /// Whether the session has been idle longer than `idle_ms` at `now`.
    #[must_use]
    pub const fn is_idle(&self, now: i64, idle_ms: i64) -> bool {
        now.saturating_sub(self.last_access_at) > idle_ms
    }

    /// The token as handed to clients.
    #[must_use]
    pub fn token(&self) -> String {
        self.id.to_string()
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session storage backends.
///
/// Timestamps are passed in by the caller so that expiry policy stays in the
/// registry and backends only keep records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a freshly minted session.
    async fn insert(&self, session: Session) -> Result<(), StorageError>;

    /// Get a session by ID without touching it.
    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError>;

    /// Set `last_access_at` to `now` and return the updated record.
    async fn touch(&self, id: SessionId, now: i64) -> Result<Option<Session>, StorageError>;

    /// Remove a session, returning it if it existed.
    async fn remove(&self, id: SessionId) -> Result<Option<Session>, StorageError>;

    /// Remove every session last accessed before `cutoff` and return their IDs.
    async fn remove_idle(&self, cutoff: i64) -> Result<Vec<SessionId>, StorageError>;

    /// Number of stored sessions.
    async fn count(&self) -> Result<usize, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_window_is_exclusive() {
        let session = Session::new(Uuid::new_v4(), 1_000);
        assert!(!session.is_idle(1_500, 500));
        assert!(session.is_idle(1_501, 500));
    }

    #[test]
    fn test_token_is_hyphenated_uuid() {
        let session = Session::new(Uuid::new_v4(), 0);
        let token = session.token();
        assert_eq!(token.len(), 36);
        assert_eq!(Uuid::parse_str(&token).unwrap(), session.id);
    }
}
