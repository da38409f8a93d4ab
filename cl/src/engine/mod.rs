//! Workflow execution
//!
//! [`ExecutionEngine`] walks a workflow's steps cycle by cycle, talking to a
//! [`crate::backend::Backend`] and writing checkpoints as it goes. A paused
//! or failed run leaves a pause record that [`load_from_pause`] turns back
//! into a runnable engine.

mod command;
#[allow(clippy::module_inception)]
mod engine;
mod error;
mod resume;
mod state;
mod verify;

pub use command::{CommandOutput, CommandSpec, run_command};
pub use engine::{DEFAULT_CHECKPOINT_DIR, EngineOptions, ExecutionEngine, RunOutcome};
pub use error::EngineError;
pub use resume::load_from_pause;
pub use state::{CheckpointRef, ExecutionState, ExecutionStatus, Message, Role};
pub use verify::{CommandVerifier, PathsVerifier, Verifier, VerifierRegistry, VerifyOutcome};
