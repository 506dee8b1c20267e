//! Session registry: mints tokens and resolves them with sliding expiry.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use pathview_core::{Session, SessionId, SessionStore, StorageError};
use uuid::Uuid;

use crate::storage::MemorySessionStore;

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found")]
    NotFound,
    #[error("Session expired: {0}")]
    Expired(SessionId),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Sessions idle longer than this are destroyed.
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Mints and resolves opaque session tokens.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    config: RegistryConfig,
}

pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A fresh id with 128 random bits.
///
/// A v4 UUID fixes 6 of its bits (version and variant). A second v4, rotated
/// so its fixed bits land on random ones, is mixed in to cover them.
fn mint_id() -> SessionId {
    let a = Uuid::new_v4().as_u128();
    let b = Uuid::new_v4().as_u128().rotate_left(8);
    Uuid::from_u128(a ^ b)
}

impl SessionRegistry {
    /// Create a registry over a storage backend.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    /// Create a registry backed by `MemorySessionStore`.
    #[must_use]
    pub fn in_memory(config: RegistryConfig) -> Self {
        Self::new(Arc::new(MemorySessionStore::new()), config)
    }

    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn idle_ms(&self) -> i64 {
        i64::try_from(self.config.idle_timeout.as_millis()).unwrap_or(i64::MAX)
    }

    /// Return the live session for `token`, or mint a new one.
    ///
    /// The second element is the id of a session that was found expired
    /// while resolving, so the caller can release what it held.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn issue(
        &self,
        token: Option<&str>,
    ) -> Result<(Session, Option<SessionId>), StorageError> {
        self.issue_at(token, now()).await
    }

    pub(crate) async fn issue_at(
        &self,
        token: Option<&str>,
        now: i64,
    ) -> Result<(Session, Option<SessionId>), StorageError> {
        let mut expired = None;
        if let Some(token) = token {
            match self.resolve_at(token, now).await {
                Ok(session) => return Ok((session, None)),
                Err(RegistryError::Storage(e)) => return Err(e),
                Err(RegistryError::Expired(id)) => expired = Some(id),
                Err(RegistryError::NotFound) => {}
            }
        }

        let session = Session::new(mint_id(), now);
        self.store.insert(session.clone()).await?;
        tracing::info!(session_id = %session.id, "Issued new session");
        Ok((session, expired))
    }

    /// Resolve a token to its live session, extending its lifetime.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown or malformed tokens, `Expired` for
    /// sessions idle past the window (which are evicted).
    pub async fn resolve(&self, token: &str) -> Result<Session, RegistryError> {
        self.resolve_at(token, now()).await
    }

    pub(crate) async fn resolve_at(&self, token: &str, now: i64) -> Result<Session, RegistryError> {
        let id = Uuid::parse_str(token.trim()).map_err(|_| RegistryError::NotFound)?;
        let session = self.store.get(id).await?.ok_or(RegistryError::NotFound)?;

        if session.is_idle(now, self.idle_ms()) {
            self.store.remove(id).await?;
            tracing::debug!(session_id = %id, "Session expired on access");
            return Err(RegistryError::Expired(id));
        }

        self.store
            .touch(id, now)
            .await?
            .ok_or(RegistryError::NotFound)
    }

    /// Mark a session as accessed at `now` without resolving its token.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn touch_at(&self, id: SessionId, now: i64) -> Result<bool, StorageError> {
        Ok(self.store.touch(id, now).await?.is_some())
    }

    /// Remove every session idle past the window.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn expire_idle(&self) -> Result<Vec<SessionId>, StorageError> {
        self.expire_idle_at(now()).await
    }

    pub(crate) async fn expire_idle_at(&self, now: i64) -> Result<Vec<SessionId>, StorageError> {
        self.store
            .remove_idle(now.saturating_sub(self.idle_ms()))
            .await
    }

    /// Number of live sessions.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn count(&self) -> Result<usize, StorageError> {
        self.store.count().await
    }
}
