//! Conversational backends
//!
//! The engine talks to a model only through the [`Backend`] trait. Adapters
//! are picked by name from an [`AdapterRegistry`].

mod client;
mod error;
mod exec;
mod mock;
mod registry;

pub use client::{Backend, CompactionResult, ContextUsage, Session, SessionConfig, StreamEvent};
pub use error::BackendError;
pub use exec::{EXIT_RATE_LIMITED, ExecBackend, ExecConfig};
pub use mock::{MockBackend, MockConfig, MockReply};
pub use registry::{AdapterRegistry, BackendConfig, DEFAULT_ADAPTER};
