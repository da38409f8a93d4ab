//! Workflow parse error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning directive text into a workflow definition
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{kind} without preceding RUN (line {line})")]
    BlockWithoutRun { kind: String, line: usize },

    #[error("{kind} opened at line {line} while a block from line {open_line} is still open (nested blocks are not allowed)")]
    NestedBlock { kind: String, line: usize, open_line: usize },

    #[error("END without an open ON-FAILURE/ON-SUCCESS block (line {line})")]
    EndWithoutBlock { line: usize },

    #[error("Unclosed {kind} block opened at line {line}")]
    UnclosedBlock { kind: String, line: usize },

    #[error("INCLUDE cycle detected: {chain}")]
    IncludeCycle { chain: String },

    #[error("INCLUDE file not found: {path} (line {line})")]
    IncludeNotFound { path: PathBuf, line: usize },

    #[error("Invalid value for {directive} at line {line}: {reason}")]
    InvalidValue {
        directive: String,
        line: usize,
        reason: String,
    },

    #[error("Failed to read workflow {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ParseError {
    /// Line number the error points at, when it has one
    pub fn line(&self) -> Option<usize> {
        match self {
            ParseError::BlockWithoutRun { line, .. }
            | ParseError::NestedBlock { line, .. }
            | ParseError::EndWithoutBlock { line }
            | ParseError::UnclosedBlock { line, .. }
            | ParseError::IncludeNotFound { line, .. }
            | ParseError::InvalidValue { line, .. } => Some(*line),
            ParseError::IncludeCycle { .. } | ParseError::Io { .. } => None,
        }
    }
}
