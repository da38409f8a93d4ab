//! Engine error types

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::ExecutionStatus;
use crate::checkpoint::CheckpointError;
use crate::context::ContextError;
use crate::detector::LoopReason;
use crate::workflow::ParseError;

/// Errors that end an execution
///
/// Fatal variants carry the pause checkpoint written just before the error
/// was raised so the caller can report where to resume from.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Missing required context files: {} (checkpoint: {})", display_paths(.missing), .checkpoint.display())]
    MissingContextFiles { missing: Vec<PathBuf>, checkpoint: PathBuf },

    #[error("Loop detected ({reason}): {detail} (checkpoint: {})", .checkpoint.display())]
    LoopDetected {
        reason: LoopReason,
        detail: String,
        checkpoint: PathBuf,
    },

    #[error("Backend aborted: {message} (checkpoint: {})", .checkpoint.display())]
    BackendAborted { message: String, checkpoint: PathBuf },

    #[error("Step '{step}' failed: {message} (checkpoint: {})", .checkpoint.display())]
    StepFailed {
        step: String,
        message: String,
        checkpoint: PathBuf,
    },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: ExecutionStatus, to: ExecutionStatus },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Workflow(#[from] ParseError),

    #[error("Cannot resume: {0}")]
    Resume(String),
}

impl EngineError {
    /// Pause checkpoint written before this error, if any
    pub fn checkpoint(&self) -> Option<&Path> {
        match self {
            EngineError::MissingContextFiles { checkpoint, .. }
            | EngineError::LoopDetected { checkpoint, .. }
            | EngineError::BackendAborted { checkpoint, .. }
            | EngineError::StepFailed { checkpoint, .. } => Some(checkpoint),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
