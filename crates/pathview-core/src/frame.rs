//! Step frames emitted by the streaming coordinator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ExecutionResult, FailureKind, Outcome};

/// Field of a step result that signals completion.
pub const COMPLETION_FLAG: &str = "done";

/// One frame of a step stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFrame {
    pub success: bool,
    /// Value returned by the step expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Primary output captured during this step only.
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl StepFrame {
    /// Build a frame from one step evaluation.
    ///
    /// A successful evaluation whose value has no boolean completion flag is
    /// turned into a failing frame, since the stream could never end.
    #[must_use]
    pub fn from_step(result: ExecutionResult) -> Self {
        let ExecutionResult {
            output, outcome, ..
        } = result;

        match outcome {
            Outcome::Success { value } => {
                let flagged = value
                    .as_ref()
                    .and_then(|v| v.get(COMPLETION_FLAG))
                    .is_some_and(Value::is_boolean);
                if flagged {
                    Self {
                        success: true,
                        result: value,
                        output,
                        error: None,
                        kind: None,
                    }
                } else {
                    let missing = Outcome::RuntimeFailure(format!(
                        "step result carries no boolean '{COMPLETION_FLAG}' completion flag"
                    ));
                    Self {
                        success: false,
                        result: value,
                        output,
                        error: missing.error_message(),
                        kind: missing.kind(),
                    }
                }
            }
            failed => Self {
                success: false,
                result: None,
                output,
                error: failed.error_message(),
                kind: failed.kind(),
            },
        }
    }

    /// Whether this frame ends the stream successfully.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.success
            && self
                .result
                .as_ref()
                .and_then(|v| v.get(COMPLETION_FLAG))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// Encode as one newline-terminated JSON line.
    ///
    /// # Errors
    /// Returns error if the frame cannot be serialized.
    pub fn to_ndjson(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}
