//! Execution state: status machine, messages and checkpoint references

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::error::EngineError;

/// Lifecycle status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Resumed,
    Consulting,
}

impl ExecutionStatus {
    /// Allowed transitions out of this status
    pub fn successors(&self) -> &'static [ExecutionStatus] {
        use ExecutionStatus::*;
        match self {
            Pending => &[Running],
            Running => &[Paused, Completed, Failed, Consulting],
            Paused | Failed | Consulting => &[Resumed],
            Resumed => &[Running, Failed],
            Completed => &[],
        }
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Resumed => "resumed",
            ExecutionStatus::Consulting => "consulting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One conversation message, never edited after it is appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Reference to a checkpoint written during this execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// Mutable state owned by one engine
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub session_id: String,
    pub cycle_number: u32,
    /// Top-level prompt steps processed in the current cycle
    pub prompt_index: usize,
    messages: Vec<Message>,
    pub checkpoints: Vec<CheckpointRef>,
    status: ExecutionStatus,
}

impl ExecutionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        debug!(%session_id, "ExecutionState::new: called");
        Self {
            session_id,
            cycle_number: 0,
            prompt_index: 0,
            messages: Vec::new(),
            checkpoints: Vec::new(),
            status: ExecutionStatus::Pending,
        }
    }

    /// Fresh state with a generated session id
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7().to_string())
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Move to `next`, rejecting transitions outside the table
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        debug!(session_id = %self.session_id, from = %self.status, to = %next, "ExecutionState::transition: called");
        self.status = next;
        Ok(())
    }

    /// Restore status from a saved record without consulting the table
    pub(crate) fn restore_status(&mut self, status: ExecutionStatus) {
        self.status = status;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub(crate) fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Most recent assistant reply
    pub fn last_response(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}
