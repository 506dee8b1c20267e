//! Transport layer for the execution kernel.
//!
//! Provides:
//! - Wire protocol (JSON request/response bodies and socket messages)
//! - HTTP routes with NDJSON step streams
//! - WebSocket transport (feature: websocket)

pub mod http;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use http::{ApiError, AppState, SESSION_HEADER, app, router};
pub use protocol::{ClientMessage, ExecutionResponse, ServerMessage};
