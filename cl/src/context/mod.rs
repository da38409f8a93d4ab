//! Context window tracking, context file loading and compaction policy

pub mod compaction;
pub mod error;
pub mod filter;
pub mod loader;
pub mod tracker;

pub use compaction::{DEFAULT_SUMMARY_INSTRUCTION, PreCycleAction, SessionMode, compaction_prompt};
pub use error::ContextError;
pub use filter::FileFilter;
pub use loader::{ContextLoader, LoadReport};
pub use tracker::{ContextStatus, ContextTracker, ContextWindow, DEFAULT_MAX_TOKENS, estimate_tokens};
