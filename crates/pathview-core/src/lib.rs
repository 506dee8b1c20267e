//! Core data model for session-scoped code execution.
//!
//! This crate provides the shared building blocks:
//! - `Session` / `SessionId` - Identity of a client-held token
//! - `ExecutionRequest` / `ExecutionResult` / `Outcome` - The execution contract
//! - `StepFrame` - One unit of the step-streaming protocol
//! - `SessionStore` trait for pluggable session storage

pub mod execution;
pub mod frame;
pub mod traits;

pub use execution::{CallKind, ExecutionRequest, ExecutionResult, FailureKind, Mode, Outcome};
pub use frame::{COMPLETION_FLAG, StepFrame};
pub use traits::{Session, SessionId, SessionStore, StorageError};
