//! convoloop - directive-driven multi-cycle conversation runner
//!
//! A workflow is a small line-oriented program of directives: prompts to
//! send, commands to run, verifications, checkpoints and gates. convoloop
//! parses it, runs it against a conversational backend for one or more
//! cycles, keeps the context window under budget by compacting or starting
//! fresh sessions, and persists enough state to pause and resume.
//!
//! # Modules
//!
//! - [`workflow`] - Directive parser, applicator, definitions and templating
//! - [`context`] - Token accounting, context file loading and session modes
//! - [`engine`] - Execution engine, state machine and resume
//! - [`checkpoint`] - Pause records and named checkpoints on disk
//! - [`detector`] - Loop and stall detection
//! - [`backend`] - Backend trait, adapter registry and built-in adapters
//! - [`batch`] - Bounded-parallel apply across component directories
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod backend;
pub mod batch;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod context;
pub mod detector;
pub mod engine;
pub mod workflow;

// Re-export commonly used types
pub use backend::{AdapterRegistry, Backend, BackendError, MockBackend};
pub use checkpoint::{Checkpoint, CheckpointStore, PauseReason, PauseRecord};
pub use config::Config;
pub use context::{ContextTracker, SessionMode};
pub use detector::{LoopDetector, LoopDetectorConfig};
pub use engine::{EngineError, EngineOptions, ExecutionEngine, ExecutionStatus, RunOutcome, load_from_pause};
pub use workflow::{Step, WorkflowDefinition, load_workflow, parse_workflow};
