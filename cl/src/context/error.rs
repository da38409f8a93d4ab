//! Context loading errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Missing required context files: {}", display_paths(.missing))]
    MissingContextFiles { missing: Vec<PathBuf> },

    #[error("Invalid file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to read context file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_lists_every_path() {
        let err = ContextError::MissingContextFiles {
            missing: vec![PathBuf::from("a.md"), PathBuf::from("b/*.rs")],
        };
        assert_eq!(err.to_string(), "Missing required context files: a.md, b/*.rs");
    }
}
