//! The execution contract shared by the engine, the coordinator and transports.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a source fragment is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// A block of statements; produces no value.
    Statements,
    /// Exactly one expression; produces its value.
    Expression,
}

impl Mode {
    /// The call tag reported alongside results produced in this mode.
    #[must_use]
    pub const fn call(self) -> CallKind {
        match self {
            Self::Statements => CallKind::RunStatements,
            Self::Expression => CallKind::EvaluateExpression,
        }
    }
}

/// Which client-facing call produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallKind {
    RunStatements,
    EvaluateExpression,
    StepStream,
}

impl CallKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStatements => "run-statements",
            Self::EvaluateExpression => "evaluate-expression",
            Self::StepStream => "step-stream",
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-visible failure classes for submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SyntaxFailure,
    RuntimeFailure,
    Timeout,
    EmptyInput,
}

/// Outcome of one engine call.
///
/// Submitted-code failures never escape the engine any other way.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The call completed. `value` is set in expression mode only.
    Success { value: Option<Value> },
    /// The source could not be parsed; nothing ran.
    SyntaxFailure(String),
    /// Execution raised, or wrote to the diagnostic channel. Effects up to the
    /// failure point are retained.
    RuntimeFailure(String),
    /// The execution budget ran out.
    Timeout(Duration),
    /// Blank source.
    EmptyInput,
    /// Aborted because the caller went away. Never reported to clients.
    Cancelled,
}

impl Outcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Failure class, or `None` for success and cancellation.
    #[must_use]
    pub const fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } | Self::Cancelled => None,
            Self::SyntaxFailure(_) => Some(FailureKind::SyntaxFailure),
            Self::RuntimeFailure(_) => Some(FailureKind::RuntimeFailure),
            Self::Timeout(_) => Some(FailureKind::Timeout),
            Self::EmptyInput => Some(FailureKind::EmptyInput),
        }
    }

    /// Human-readable error text, or `None` on success.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::SyntaxFailure(msg) => Some(format!("Syntax Error: {msg}")),
            Self::RuntimeFailure(msg) => Some(format!("Runtime Error: {msg}")),
            Self::Timeout(budget) => Some(format!(
                "Timeout: execution exceeded its {} ms budget",
                budget.as_millis()
            )),
            Self::EmptyInput => Some("No code provided".to_string()),
            Self::Cancelled => Some("Execution cancelled".to_string()),
        }
    }
}

/// A single unit of work for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub mode: Mode,
    pub source: String,
    /// Optional wall-clock budget for this call.
    pub budget: Option<Duration>,
}

impl ExecutionRequest {
    #[must_use]
    pub fn statements(source: impl Into<String>) -> Self {
        Self {
            mode: Mode::Statements,
            source: source.into(),
            budget: None,
        }
    }

    #[must_use]
    pub fn expression(source: impl Into<String>) -> Self {
        Self {
            mode: Mode::Expression,
            source: source.into(),
            budget: None,
        }
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }
}

/// Result of one engine call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub mode: Mode,
    /// Everything captured from the primary output channel.
    pub output: String,
    pub outcome: Outcome,
}

impl ExecutionResult {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Computed value of an expression-mode call.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Success { value } => value.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.outcome.error_message()
    }

    #[must_use]
    pub const fn kind(&self) -> Option<FailureKind> {
        self.outcome.kind()
    }

    #[must_use]
    pub const fn call(&self) -> CallKind {
        self.mode.call()
    }
}
