//! Namespace store: one exclusively-locked interpreter per session.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex as SyncMutex, RwLock};
use pathview_core::{CallKind, ExecutionRequest, ExecutionResult, SessionId};
use pathview_engine::{EngineError, ExecOptions, ExecutionEngine, Interpreter};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::registry::now;

/// Namespace error (never caused by submitted code).
#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Execution task failed: {0}")]
    TaskFailed(String),
}

/// Most recent failure produced against a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastFailure {
    pub call: CallKind,
    pub message: String,
    /// Unix epoch milliseconds.
    pub at: i64,
}

type FailureSlot = Arc<SyncMutex<Option<LastFailure>>>;

/// A session's program state.
pub struct Namespace {
    session_id: SessionId,
    interpreter: Arc<Mutex<Interpreter>>,
    last_failure: FailureSlot,
}

impl Namespace {
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Last failure recorded against this namespace. Does not wait for the lease.
    #[must_use]
    pub fn last_failure(&self) -> Option<LastFailure> {
        self.last_failure.lock().clone()
    }

    /// Wait for exclusive access.
    pub async fn lease(&self) -> NamespaceLease {
        NamespaceLease {
            session_id: self.session_id,
            guard: Arc::clone(&self.interpreter).lock_owned().await,
            last_failure: Arc::clone(&self.last_failure),
        }
    }

    /// Exclusive access if nobody else holds it right now.
    #[must_use]
    pub fn try_lease(&self) -> Option<NamespaceLease> {
        Arc::clone(&self.interpreter)
            .try_lock_owned()
            .ok()
            .map(|guard| NamespaceLease {
                session_id: self.session_id,
                guard,
                last_failure: Arc::clone(&self.last_failure),
            })
    }

    /// Whether a call or stream currently holds the lease.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.interpreter.try_lock().is_err()
    }
}

/// Exclusive access to one namespace. Dropping the lease releases it.
pub struct NamespaceLease {
    session_id: SessionId,
    guard: OwnedMutexGuard<Interpreter>,
    last_failure: FailureSlot,
}

impl NamespaceLease {
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Run one request on a blocking thread and hand the lease back.
    ///
    /// If the returned future is dropped, the lease is released once the
    /// blocking call finishes.
    ///
    /// # Errors
    /// Returns error if the blocking task panicked.
    pub async fn execute(
        self,
        engine: Arc<ExecutionEngine>,
        call: CallKind,
        request: ExecutionRequest,
        opts: ExecOptions,
    ) -> Result<(Self, ExecutionResult), NamespaceError> {
        tokio::task::spawn_blocking(move || {
            let result = engine.run_request(&self.guard, &request, &opts);
            if let (Some(_), Some(message)) = (result.kind(), result.error()) {
                *self.last_failure.lock() = Some(LastFailure {
                    call,
                    message,
                    at: now(),
                });
            }
            (self, result)
        })
        .await
        .map_err(|e| NamespaceError::TaskFailed(e.to_string()))
    }
}

/// Holds one namespace per live session.
pub struct NamespaceStore {
    engine: Arc<ExecutionEngine>,
    namespaces: RwLock<HashMap<SessionId, Arc<Namespace>>>,
}

impl NamespaceStore {
    #[must_use]
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self {
            engine,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn engine(&self) -> Arc<ExecutionEngine> {
        Arc::clone(&self.engine)
    }

    /// Existing namespace for `session_id`, allocating an empty one on first use.
    ///
    /// # Errors
    /// Returns error if a new interpreter cannot be created.
    pub fn get_or_create(&self, session_id: SessionId) -> Result<Arc<Namespace>, NamespaceError> {
        if let Some(ns) = self.get(session_id) {
            return Ok(ns);
        }

        let mut namespaces = self.namespaces.write();
        if let Some(ns) = namespaces.get(&session_id) {
            return Ok(Arc::clone(ns));
        }
        let ns = Arc::new(Namespace {
            session_id,
            interpreter: Arc::new(Mutex::new(self.engine.new_namespace()?)),
            last_failure: Arc::default(),
        });
        namespaces.insert(session_id, Arc::clone(&ns));
        tracing::debug!(%session_id, "Allocated namespace");
        Ok(ns)
    }

    /// Namespace for `session_id` if one was allocated.
    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<Arc<Namespace>> {
        self.namespaces.read().get(&session_id).map(Arc::clone)
    }

    /// Release a namespace. In-flight leases keep it alive until they end.
    pub fn release(&self, session_id: SessionId) -> bool {
        let removed = self.namespaces.write().remove(&session_id).is_some();
        if removed {
            tracing::debug!(%session_id, "Released namespace");
        }
        removed
    }

    /// Sessions whose namespace is in use right now.
    #[must_use]
    pub fn busy(&self) -> Vec<SessionId> {
        self.namespaces
            .read()
            .values()
            .filter(|ns| ns.is_leased())
            .map(|ns| ns.session_id)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.namespaces.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
