//! On-disk checkpoint records

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextStatus;
use crate::engine::{ExecutionStatus, Message};

pub const PAUSE_RECORD_TYPE: &str = "pause";

/// Why an execution stopped and wrote a pause record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// PAUSE step
    #[default]
    Gate,
    /// CONSULT step
    Consult,
    RateLimited,
    ContextLimit,
    Stopped,
    LoopDetected,
    MissingContext,
    BackendAborted,
    StepFailed,
}

impl PauseReason {
    /// Gates resume after the step that paused; everything else retries it
    pub fn resumes_after_step(&self) -> bool {
        matches!(self, PauseReason::Gate | PauseReason::Consult)
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PauseReason::Gate => "pause",
            PauseReason::Consult => "consult",
            PauseReason::RateLimited => "rate limited",
            PauseReason::ContextLimit => "context limit",
            PauseReason::Stopped => "stopped",
            PauseReason::LoopDetected => "loop detected",
            PauseReason::MissingContext => "missing context",
            PauseReason::BackendAborted => "backend aborted",
            PauseReason::StepFailed => "step failed",
        };
        f.write_str(name)
    }
}

/// Singleton pause record, `pause.json` in a session directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub message: String,
    #[serde(default)]
    pub reason: PauseReason,
    pub status: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default)]
    pub backend_resume_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_content: Option<String>,
    pub cycle_number: u32,
    pub prompt_index: usize,
    /// Top-level step being executed when the record was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub messages: Vec<Message>,
    pub context_status: ContextStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PauseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub prompt_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_path: Option<PathBuf>,
}

/// Named point-in-time snapshot, never overwritten
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub cycle_number: u32,
    pub metadata: CheckpointMetadata,
    pub messages: Vec<Message>,
    pub context_status: ContextStatus,
}

impl Checkpoint {
    pub fn new(name: impl Into<String>, cycle_number: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            timestamp: Utc::now(),
            cycle_number,
            metadata: CheckpointMetadata::default(),
            messages: Vec::new(),
            context_status: ContextStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> PauseRecord {
        PauseRecord {
            record_type: PAUSE_RECORD_TYPE.to_string(),
            message: "review".to_string(),
            reason: PauseReason::Gate,
            status: ExecutionStatus::Paused,
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            backend_resume_handle: None,
            workflow_path: Some(PathBuf::from("/w/flow.conv")),
            workflow_content: None,
            cycle_number: 1,
            prompt_index: 2,
            step_index: Some(4),
            messages: vec![Message::user("hi")],
            context_status: ContextStatus::default(),
            expires_at: None,
        }
    }

    #[test]
    fn test_pause_record_json_shape() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["type"], "pause");
        assert_eq!(json["status"], "paused");
        assert_eq!(json["reason"], "gate");
        assert!(json.get("workflow_content").is_none());
        assert!(json.get("expires_at").is_none());
    }

    #[test]
    fn test_expiry() {
        let mut rec = record();
        let now = Utc::now();
        assert!(!rec.is_expired(now));
        rec.expires_at = Some(now - Duration::seconds(1));
        assert!(rec.is_expired(now));
    }

    #[test]
    fn test_resume_position_by_reason() {
        assert!(PauseReason::Gate.resumes_after_step());
        assert!(PauseReason::Consult.resumes_after_step());
        assert!(!PauseReason::RateLimited.resumes_after_step());
        assert!(!PauseReason::ContextLimit.resumes_after_step());
        assert!(!PauseReason::StepFailed.resumes_after_step());
    }
}
