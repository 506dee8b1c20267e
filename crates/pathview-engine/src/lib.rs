//! Execution engine for session namespaces.
//!
//! Provides:
//! - `Interpreter` - One Lua state per session; its globals are the namespace
//! - `ExecutionEngine` - Run statements / evaluate expressions with output capture
//! - Time budgets and cancellation via an instruction hook

pub mod capture;
pub mod engine;
pub mod interpreter;
pub mod value;

pub use capture::{Channel, OutputCapture};
pub use engine::{EngineConfig, ExecOptions, ExecutionEngine};
pub use interpreter::{EngineError, Interpreter};
