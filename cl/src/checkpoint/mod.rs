//! Durable execution snapshots
//!
//! A session directory holds at most one pause record plus any number of
//! named checkpoints. Pause records are what `resume` reads; named
//! checkpoints are informational snapshots and are never deleted
//! automatically.

pub mod record;
pub mod store;

pub use record::{Checkpoint, CheckpointMetadata, PAUSE_RECORD_TYPE, PauseReason, PauseRecord};
pub use store::{CheckpointError, CheckpointStore, PAUSE_FILE, sanitize_name};
