//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use pathview_core::{Session, SessionId, SessionStore, StorageError};

/// In-memory storage implementation.
///
/// Suitable for single-process deployments. Data is lost on restart.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), StorageError> {
        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(session.id, session);
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn touch(&self, id: SessionId, now: i64) -> Result<Option<Session>, StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        Ok(sessions.get_mut(&id).map(|session| {
            session.last_access_at = session.last_access_at.max(now);
            session.clone()
        }))
    }

    async fn remove(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        Ok(self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(&id))
    }

    async fn remove_idle(&self, cutoff: i64) -> Result<Vec<SessionId>, StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let idle: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.last_access_at < cutoff)
            .map(|s| s.id)
            .collect();
        for id in &idle {
            sessions.remove(id);
        }
        Ok(idle)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .len())
    }
}
