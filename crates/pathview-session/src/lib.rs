//! Session orchestration for the execution kernel.
//!
//! Provides:
//! - `SessionRegistry` - Mint and resolve opaque session tokens
//! - `NamespaceStore` - One exclusive namespace per live session
//! - `StepCoordinator` - Stream step frames with backpressure and cancellation
//! - `SessionManager` - Facade tying the pieces together
//! - In-memory session storage

pub mod manager;
pub mod namespace;
pub mod registry;
pub mod storage;
pub mod stream;

pub use manager::{ManagerConfig, ManagerError, SessionManager};
pub use namespace::{LastFailure, Namespace, NamespaceLease, NamespaceStore};
pub use registry::{RegistryConfig, RegistryError, SessionRegistry};
pub use stream::{
    DEFAULT_STEP_EXPR, FrameSink, StepCoordinator, StreamOutcome, StreamReport, TransportClosed,
};
