//! Step-streaming coordinator.
//!
//! Repeatedly evaluates a step expression against one namespace and pushes
//! one frame per evaluation into a `FrameSink`. The loop holds the namespace
//! lease for the whole stream and suspends in exactly two places per
//! iteration: the cancellation check before a step, and frame delivery.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pathview_core::{CallKind, ExecutionRequest, Outcome, SessionId, StepFrame};
use pathview_engine::{ExecOptions, ExecutionEngine};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::namespace::{NamespaceError, NamespaceLease};

/// Step expression used when a stream is opened without one.
pub const DEFAULT_STEP_EXPR: &str = "_step_streaming_gen()";

/// The consumer of a stream went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Transport closed")]
pub struct TransportClosed;

/// Destination for step frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Resolve once the transport has fully accepted `frame`.
    async fn deliver(&mut self, frame: &StepFrame) -> Result<(), TransportClosed>;

    /// Resolve when the consumer has gone away.
    async fn closed(&self);
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    /// A frame carried a true completion flag.
    Completed,
    /// A step failed; its failing frame was the last one.
    Failed,
    /// The client cancelled or disconnected.
    Cancelled,
}

/// Summary of a finished stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamReport {
    pub outcome: StreamOutcome,
    /// Frames fully delivered.
    pub frames: usize,
}

/// Drives step streams.
#[derive(Clone)]
pub struct StepCoordinator {
    engine: Arc<ExecutionEngine>,
}

impl StepCoordinator {
    #[must_use]
    pub const fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }

    /// Run a stream to completion, failure or cancellation.
    ///
    /// The lease is released on every exit path.
    ///
    /// # Errors
    /// Returns error only for faults outside submitted code.
    pub async fn run<S>(
        &self,
        lease: NamespaceLease,
        step_expr: &str,
        budget: Option<Duration>,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> Result<StreamReport, NamespaceError>
    where
        S: FrameSink + ?Sized,
    {
        let session_id = lease.session_id();
        let step_cancel = cancel.child_token();
        let mut lease = lease;
        let mut frames = 0usize;

        let outcome = loop {
            if cancel.is_cancelled() {
                break StreamOutcome::Cancelled;
            }

            let request = ExecutionRequest::expression(step_expr).with_budget(budget);
            let opts = ExecOptions::default().cancel_on(step_cancel.clone());
            let step = lease.execute(Arc::clone(&self.engine), CallKind::StepStream, request, opts);

            let (returned, result) = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    step_cancel.cancel();
                    break StreamOutcome::Cancelled;
                }
                () = sink.closed() => {
                    step_cancel.cancel();
                    break StreamOutcome::Cancelled;
                }
                res = step => res?,
            };
            lease = returned;

            if result.outcome == Outcome::Cancelled {
                break StreamOutcome::Cancelled;
            }

            let frame = StepFrame::from_step(result);
            let delivered = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(TransportClosed),
                res = sink.deliver(&frame) => res,
            };
            if delivered.is_err() {
                break StreamOutcome::Cancelled;
            }
            frames += 1;

            if !frame.success {
                break StreamOutcome::Failed;
            }
            if frame.is_done() {
                break StreamOutcome::Completed;
            }
        };

        log_end(session_id, outcome, frames);
        Ok(StreamReport { outcome, frames })
    }
}

fn log_end(session_id: SessionId, outcome: StreamOutcome, frames: usize) {
    match outcome {
        StreamOutcome::Completed => {
            tracing::info!(%session_id, frames, "Step stream completed");
        }
        StreamOutcome::Failed => {
            tracing::debug!(%session_id, frames, "Step stream ended on failed step");
        }
        StreamOutcome::Cancelled => {
            tracing::debug!(%session_id, frames, "Step stream cancelled");
        }
    }
}
