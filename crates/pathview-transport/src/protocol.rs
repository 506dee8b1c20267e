//! Wire protocol for client-server communication.

use std::time::Duration;

use pathview_core::{CallKind, ExecutionResult, FailureKind, StepFrame};
use pathview_session::StreamOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a run or evaluate call as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub success: bool,
    pub call: CallKind,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl From<ExecutionResult> for ExecutionResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            success: result.success(),
            call: result.call(),
            value: result.value().cloned(),
            error: result.error(),
            kind: result.kind(),
            output: result.output,
        }
    }
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind the connection to a session, reusing `token` while it is live.
    Initialize {
        #[serde(default)]
        token: Option<String>,
    },
    /// Run a statement block.
    Run {
        source: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Evaluate an expression.
    Evaluate {
        source: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Open a step stream.
    OpenStream {
        #[serde(default)]
        expr: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Cancel the open step stream.
    CancelStream,
    /// Ping for keepalive.
    Ping,
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection bound to a session.
    Session { token: String },
    /// Result of a run or evaluate call.
    Result(ExecutionResponse),
    /// One step of the open stream.
    Frame(StepFrame),
    /// The open stream ended.
    StreamEnded { outcome: StreamOutcome, frames: usize },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Body of `POST /execute-code`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteCodeRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Body of `POST /evaluate-expression`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default)]
    pub expr: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Body of `POST /streamData`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamRequest {
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Client-supplied budget in milliseconds.
pub(crate) fn budget(timeout_ms: Option<u64>) -> Option<Duration> {
    timeout_ms.map(Duration::from_millis)
}

/// Body of `/initialize` and `/idCheck`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub success: bool,
    pub id: Option<String>,
}

/// Body of `/traceback`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracebackResponse {
    pub success: bool,
    pub traceback: Option<String>,
}

/// Body of `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}
