//! Backend error types

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a conversational backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Rate limited{}", .retry_after.map(|d| format!(", retry after {:?}", d)).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("Backend aborted: {0}")]
    Aborted(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Backend failed: {0}")]
    Failed(String),

    #[error("Unknown adapter '{name}' (available: {available})")]
    UnknownAdapter { name: String, available: String },

    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, BackendError::RateLimited { .. })
    }

    /// Check if the backend asked for the whole run to stop
    pub fn is_abort(&self) -> bool {
        matches!(self, BackendError::Aborted(_))
    }

    /// Get the retry duration if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_rate_limit() {
        let err = BackendError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert!(err.to_string().contains("retry after 60s"));

        let err = BackendError::Failed("boom".to_string());
        assert!(!err.is_rate_limit());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_rate_limit_without_hint() {
        let err = BackendError::RateLimited { retry_after: None };
        assert_eq!(err.to_string(), "Rate limited");
    }

    #[test]
    fn test_is_abort() {
        assert!(BackendError::Aborted("user cancelled".to_string()).is_abort());
        assert!(!BackendError::Timeout(Duration::from_secs(1)).is_abort());
    }
}
