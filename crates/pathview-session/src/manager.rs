//! Session manager tying tokens, namespaces and step streams together.

use std::{sync::Arc, time::Duration};

use pathview_core::{
    ExecutionRequest, ExecutionResult, Session, SessionId, SessionStore, StorageError,
};
use pathview_engine::{EngineConfig, ExecOptions, ExecutionEngine};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    namespace::{LastFailure, NamespaceError, NamespaceStore},
    registry::{RegistryConfig, RegistryError, SessionRegistry},
    storage::MemorySessionStore,
    stream::{DEFAULT_STEP_EXPR, FrameSink, StepCoordinator, StreamOutcome, StreamReport},
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Session not found")]
    SessionNotFound,
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Namespace error: {0}")]
    Namespace(#[from] NamespaceError),
}

impl ManagerError {
    /// Whether this is a fault of the kernel rather than of the caller.
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        !matches!(self, Self::SessionNotFound)
    }
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub registry: RegistryConfig,
    pub engine: EngineConfig,
    /// Budget for run/evaluate calls that do not name one.
    pub exec_budget: Option<Duration>,
    /// Budget for each step of a stream that does not name one.
    pub step_budget: Option<Duration>,
    /// Step expression for streams opened without one.
    pub step_expr: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            engine: EngineConfig::default(),
            exec_budget: None,
            step_budget: None,
            step_expr: DEFAULT_STEP_EXPR.to_string(),
        }
    }
}

/// Session manager for the execution kernel.
pub struct SessionManager {
    registry: SessionRegistry,
    namespaces: NamespaceStore,
    coordinator: StepCoordinator,
    config: ManagerConfig,
}

impl SessionManager {
    /// Create a manager backed by in-memory session storage.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_store(Arc::new(MemorySessionStore::new()), config)
    }

    /// Create a manager over a session storage backend.
    #[must_use]
    pub fn with_store(store: Arc<dyn SessionStore>, config: ManagerConfig) -> Self {
        let engine = Arc::new(ExecutionEngine::new(config.engine.clone()));
        Self {
            registry: SessionRegistry::new(store, config.registry.clone()),
            namespaces: NamespaceStore::new(Arc::clone(&engine)),
            coordinator: StepCoordinator::new(engine),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Return the live session for `token`, or mint a fresh one.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn initialize(&self, token: Option<&str>) -> Result<Session, ManagerError> {
        let (session, expired) = self.registry.issue(token).await?;
        if let Some(id) = expired {
            self.namespaces.release(id);
        }
        Ok(session)
    }

    /// Resolve a token without minting.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for unknown, malformed or expired tokens.
    pub async fn check(&self, token: &str) -> Result<Session, ManagerError> {
        self.resolve(token).await
    }

    /// Execute a statement block in the session's namespace.
    ///
    /// # Errors
    /// Returns error if the session is unknown or the kernel faults.
    /// Failures of the submitted code are reported in the result.
    pub async fn run_statements(
        &self,
        token: &str,
        source: impl Into<String>,
        budget: Option<Duration>,
    ) -> Result<ExecutionResult, ManagerError> {
        self.execute(token, ExecutionRequest::statements(source).with_budget(budget))
            .await
    }

    /// Evaluate a single expression in the session's namespace.
    ///
    /// # Errors
    /// Returns error if the session is unknown or the kernel faults.
    pub async fn evaluate_expression(
        &self,
        token: &str,
        source: impl Into<String>,
        budget: Option<Duration>,
    ) -> Result<ExecutionResult, ManagerError> {
        self.execute(token, ExecutionRequest::expression(source).with_budget(budget))
            .await
    }

    /// Execute a request, waiting for any call or stream already holding the
    /// namespace.
    ///
    /// # Errors
    /// Returns error if the session is unknown or the kernel faults.
    pub async fn execute(
        &self,
        token: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ManagerError> {
        let session = self.resolve(token).await?;
        let namespace = self.namespaces.get_or_create(session.id)?;
        let call = request.mode.call();
        let budget = request.budget.or(self.config.exec_budget);
        let request = request.with_budget(budget);

        let lease = namespace.lease().await;
        let (_, result) = lease
            .execute(self.namespaces.engine(), call, request, ExecOptions::default())
            .await?;

        match result.kind() {
            None => tracing::debug!(session_id = %session.id, %call, "Call succeeded"),
            Some(kind) => tracing::debug!(session_id = %session.id, %call, ?kind, "Call failed"),
        }
        Ok(result)
    }

    /// Stream step frames into `sink` until completion, failure or cancellation.
    ///
    /// The namespace stays leased for the whole stream.
    ///
    /// # Errors
    /// Returns error if the session is unknown or the kernel faults.
    pub async fn open_step_stream<S>(
        &self,
        token: &str,
        step_expr: Option<&str>,
        budget: Option<Duration>,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> Result<StreamReport, ManagerError>
    where
        S: FrameSink + ?Sized,
    {
        let session = self.resolve(token).await?;
        let namespace = self.namespaces.get_or_create(session.id)?;
        let step_expr = step_expr
            .filter(|expr| !expr.trim().is_empty())
            .unwrap_or(&self.config.step_expr);
        let budget = budget.or(self.config.step_budget);

        let lease = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Ok(StreamReport { outcome: StreamOutcome::Cancelled, frames: 0 });
            }
            lease = namespace.lease() => lease,
        };
        tracing::info!(session_id = %session.id, step_expr, "Step stream opened");

        let report = self
            .coordinator
            .run(lease, step_expr, budget, sink, cancel)
            .await?;
        Ok(report)
    }

    /// Most recent failure in the session, if any.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for unknown or expired tokens.
    pub async fn last_failure(&self, token: &str) -> Result<Option<LastFailure>, ManagerError> {
        let session = self.resolve(token).await?;
        Ok(self
            .namespaces
            .get(session.id)
            .and_then(|ns| ns.last_failure()))
    }

    /// Destroy every session idle past the window, with its namespace.
    ///
    /// A session whose namespace is leased (a running call or open stream)
    /// counts as accessed at sweep time and is kept.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn expire_idle(&self) -> Result<usize, ManagerError> {
        self.expire_idle_at(crate::registry::now()).await
    }

    async fn expire_idle_at(&self, now: i64) -> Result<usize, ManagerError> {
        for id in self.namespaces.busy() {
            self.registry.touch_at(id, now).await?;
        }
        let expired = self.registry.expire_idle_at(now).await?;
        Ok(self.release_all(&expired))
    }

    fn release_all(&self, expired: &[SessionId]) -> usize {
        for id in expired {
            self.namespaces.release(*id);
        }
        expired.len()
    }

    /// Periodically destroy idle sessions.
    pub fn spawn_reaper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.expire_idle().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "Expired idle sessions"),
                    Err(e) => tracing::error!(error = %e, "Failed to expire idle sessions"),
                }
            }
        })
    }

    /// Number of live sessions.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn session_count(&self) -> Result<usize, ManagerError> {
        Ok(self.registry.count().await?)
    }

    async fn resolve(&self, token: &str) -> Result<Session, ManagerError> {
        match self.registry.resolve(token).await {
            Ok(session) => Ok(session),
            Err(RegistryError::Expired(id)) => {
                self.namespaces.release(id);
                Err(ManagerError::SessionNotFound)
            }
            Err(RegistryError::NotFound) => Err(ManagerError::SessionNotFound),
            Err(RegistryError::Storage(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pathview_core::{CallKind, FailureKind, StepFrame};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::stream::{TransportClosed, tests::VecSink};

    fn manager() -> SessionManager {
        SessionManager::new(ManagerConfig::default())
    }

    async fn token(manager: &SessionManager) -> String {
        manager.initialize(None).await.unwrap().token()
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let manager = manager();
        let first = manager.initialize(None).await.unwrap();
        let again = manager.initialize(Some(&first.token())).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(manager.session_count().await.unwrap(), 1);

        let other = manager.initialize(Some("garbage")).await.unwrap();
        assert_ne!(other.id, first.id);
        assert_eq!(manager.session_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let manager = manager();
        let err = manager.run_statements("nope", "x = 1", None).await.unwrap_err();
        assert!(matches!(err, ManagerError::SessionNotFound));
        assert!(!err.is_server_error());
        assert!(matches!(
            manager.check("nope").await,
            Err(ManagerError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_state_persists_between_calls() {
        let manager = manager();
        let token = token(&manager).await;

        tokio_test::assert_ok!(manager.check(&token).await);
        let run = manager
            .run_statements(&token, "x = 5\nprint('set')", None)
            .await
            .unwrap();
        assert!(run.success());
        assert_eq!(run.output, "set\n");
        assert_eq!(run.call(), CallKind::RunStatements);

        let eval = manager.evaluate_expression(&token, "x * 2", None).await.unwrap();
        assert_eq!(eval.value(), Some(&json!(10)));
        assert_eq!(eval.call(), CallKind::EvaluateExpression);
    }

    #[tokio::test]
    async fn test_last_failure_tracks_most_recent() {
        let manager = manager();
        let token = token(&manager).await;
        assert_eq!(manager.last_failure(&token).await.unwrap(), None);

        manager.evaluate_expression(&token, "missing", None).await.unwrap();
        manager.run_statements(&token, "ok = 1", None).await.unwrap();

        let failure = manager.last_failure(&token).await.unwrap().unwrap();
        assert_eq!(failure.call, CallKind::EvaluateExpression);
        assert!(failure.message.contains("missing"));
    }

    #[tokio::test]
    async fn test_default_exec_budget_applies() {
        let manager = SessionManager::new(ManagerConfig {
            exec_budget: Some(Duration::from_millis(50)),
            ..ManagerConfig::default()
        });
        let token = token(&manager).await;

        let result = manager
            .run_statements(&token, "while true do end", None)
            .await
            .unwrap();
        assert_eq!(result.kind(), Some(FailureKind::Timeout));

        // the namespace survives and is usable again
        let after = manager.evaluate_expression(&token, "1 + 1", None).await.unwrap();
        assert_eq!(after.value(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_expired_sessions_lose_their_namespace() {
        let manager = SessionManager::new(ManagerConfig {
            registry: RegistryConfig {
                idle_timeout: Duration::from_secs(60),
            },
            ..ManagerConfig::default()
        });
        let token = token(&manager).await;
        manager.run_statements(&token, "x = 1", None).await.unwrap();
        assert_eq!(manager.namespaces.len(), 1);

        let far_future = crate::registry::now() + 120_000;
        assert_eq!(manager.expire_idle_at(far_future).await.unwrap(), 1);
        assert!(manager.namespaces.is_empty());
        assert!(matches!(
            manager.check(&token).await,
            Err(ManagerError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_open_stream_keeps_session_alive() {
        let manager = Arc::new(SessionManager::new(ManagerConfig {
            registry: RegistryConfig {
                idle_timeout: Duration::from_secs(60),
            },
            ..ManagerConfig::default()
        }));
        let streaming_token = token(&manager).await;
        let idle_token = token(&manager).await;
        manager
            .run_statements(&streaming_token, "function forever() return { done = false } end", None)
            .await
            .unwrap();
        manager.run_statements(&idle_token, "y = 1", None).await.unwrap();

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let streaming = {
            let manager = Arc::clone(&manager);
            let token = streaming_token.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut sink = ChannelSink(tx);
                manager
                    .open_step_stream(&token, Some("forever()"), None, &mut sink, cancel)
                    .await
                    .unwrap()
            })
        };
        assert!(rx.recv().await.unwrap().success);

        // only the idle session goes, even though both are past the window
        let far_future = crate::registry::now() + 120_000;
        assert_eq!(manager.expire_idle_at(far_future).await.unwrap(), 1);
        assert!(matches!(
            manager.check(&idle_token).await,
            Err(ManagerError::SessionNotFound)
        ));

        cancel.cancel();
        drop(rx);
        assert_eq!(streaming.await.unwrap().outcome, StreamOutcome::Cancelled);

        let session = manager.check(&streaming_token).await.unwrap();
        assert!(manager.namespaces.get(session.id).is_some());
        let state = manager
            .evaluate_expression(&streaming_token, "type(forever)", None)
            .await
            .unwrap();
        assert_eq!(state.value(), Some(&json!("function")));
    }

    #[tokio::test]
    async fn test_stream_uses_configured_default_expression() {
        let manager = SessionManager::new(ManagerConfig {
            step_expr: "tick()".to_string(),
            ..ManagerConfig::default()
        });
        let token = token(&manager).await;
        manager
            .run_statements(&token, "function tick() return { done = true } end", None)
            .await
            .unwrap();

        let mut sink = VecSink::new();
        let report = manager
            .open_step_stream(&token, None, None, &mut sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, StreamOutcome::Completed);
        assert_eq!(report.frames, 1);
    }

    #[tokio::test]
    async fn test_stream_on_unknown_session_is_not_found() {
        let manager = manager();
        let mut sink = VecSink::new();
        let err = manager
            .open_step_stream("nope", None, None, &mut sink, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::SessionNotFound));
        assert!(sink.frames.is_empty());
    }

    /// Forwards frames to a channel so a test can act between steps.
    struct ChannelSink(mpsc::Sender<StepFrame>);

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn deliver(&mut self, frame: &StepFrame) -> Result<(), TransportClosed> {
            self.0.send(frame.clone()).await.map_err(|_| TransportClosed)
        }

        async fn closed(&self) {
            self.0.closed().await;
        }
    }

    #[tokio::test]
    async fn test_run_waits_for_open_stream() {
        let manager = Arc::new(manager());
        let token = token(&manager).await;
        manager
            .run_statements(
                &token,
                "n = 0\nfunction step() n = n + 1 return { done = n >= 5, n = n } end",
                None,
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let streaming = {
            let manager = Arc::clone(&manager);
            let token = token.clone();
            tokio::spawn(async move {
                let mut sink = ChannelSink(tx);
                manager
                    .open_step_stream(&token, Some("step()"), None, &mut sink, CancellationToken::new())
                    .await
                    .unwrap()
            })
        };

        // the stream holds the namespace once its first frame arrives
        let first = rx.recv().await.unwrap();
        let writer = {
            let manager = Arc::clone(&manager);
            let token = token.clone();
            tokio::spawn(async move { manager.run_statements(&token, "n = 100", None).await })
        };

        let mut seen = vec![first.result.unwrap()["n"].clone()];
        while let Some(frame) = rx.recv().await {
            seen.push(frame.result.unwrap()["n"].clone());
        }
        assert_eq!(seen, [json!(1), json!(2), json!(3), json!(4), json!(5)]);

        assert_eq!(streaming.await.unwrap().outcome, StreamOutcome::Completed);
        assert!(writer.await.unwrap().unwrap().success());
        let n = manager.evaluate_expression(&token, "n", None).await.unwrap();
        assert_eq!(n.value(), Some(&json!(100)));
    }
}
