//! Backend trait definition

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::BackendError;

/// Streamed output delivered while a prompt is in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Part of the visible response
    Chunk(String),
    /// Part of the model's reasoning stream
    Reasoning(String),
}

/// Settings for a new backend session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: Option<String>,
    pub workdir: PathBuf,
    #[serde(default)]
    pub allow_files: Vec<String>,
    #[serde(default)]
    pub deny_files: Vec<String>,
}

/// Handle to a live backend conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Opaque handle that can reattach to this conversation later
    pub resume_handle: Option<String>,
}

/// Authoritative token accounting reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub used: usize,
    pub max: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionResult {
    pub summary: String,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Conversational backend the engine drives
///
/// A backend owns the conversation: the engine sends prompt text and gets
/// the response text back. Streaming output, when the backend has any, is
/// pushed to `events` in order before `send` returns.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Adapter name, as registered
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), BackendError>;

    async fn stop(&self) -> Result<(), BackendError>;

    async fn create_session(&self, config: &SessionConfig) -> Result<Session, BackendError>;

    async fn destroy_session(&self, session: &Session) -> Result<(), BackendError>;

    /// Send one prompt and wait for the full response
    async fn send(
        &self,
        session: &Session,
        prompt: &str,
        events: Option<mpsc::UnboundedSender<StreamEvent>>,
    ) -> Result<String, BackendError>;

    /// Real usage, or `None` when the backend cannot report it
    async fn get_context_usage(&self, session: &Session) -> Result<Option<ContextUsage>, BackendError>;

    /// Summarize the conversation in place
    async fn compact(
        &self,
        session: &Session,
        preserve: &[String],
        summary_prompt: &str,
    ) -> Result<CompactionResult, BackendError>;

    /// Reattach to a conversation from its resume handle
    async fn resume_session(&self, handle: &str, _config: &SessionConfig) -> Result<Session, BackendError> {
        Err(BackendError::Unsupported(format!("resume_session({})", handle)))
    }

    async fn delete_session(&self, handle: &str) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(format!("delete_session({})", handle)))
    }

    async fn list_sessions(&self) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }
}
