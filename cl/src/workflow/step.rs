//! Workflow steps - the executable units of a workflow program

use std::fmt;

use serde::{Deserialize, Serialize};

/// Discriminant of a [`Step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Prompt,
    Compact,
    Checkpoint,
    Run,
    Verify,
    Pause,
    Consult,
    NewConversation,
    Elide,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prompt => "prompt",
            Self::Compact => "compact",
            Self::Checkpoint => "checkpoint",
            Self::Run => "run",
            Self::Verify => "verify",
            Self::Pause => "pause",
            Self::Consult => "consult",
            Self::NewConversation => "new_conversation",
            Self::Elide => "elide",
        };
        f.write_str(name)
    }
}

/// A RUN step with its retry settings and attached blocks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    /// Shell command (empty when created by an orphan RUN-RETRY)
    pub command: String,

    /// Times to ask the backend for a fix and rerun on failure
    #[serde(default)]
    pub retry_count: u32,

    /// Prompt sent to the backend before each retry
    #[serde(default)]
    pub retry_prompt: Option<String>,

    /// Steps executed when the command ultimately fails
    #[serde(default)]
    pub on_failure: Vec<Step>,

    /// Steps executed when the command succeeds
    #[serde(default)]
    pub on_success: Vec<Step>,
}

impl RunStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn has_blocks(&self) -> bool {
        !self.on_failure.is_empty() || !self.on_success.is_empty()
    }
}

/// One executable unit of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Prompt { content: String },
    Compact { preserve: Vec<String> },
    Checkpoint { name: Option<String> },
    Run(RunStep),
    Verify { verifier: String, args: String },
    Pause { message: String },
    Consult { topic: String },
    NewConversation,
    Elide,
}

impl Step {
    pub fn prompt(content: impl Into<String>) -> Self {
        Step::Prompt {
            content: content.into(),
        }
    }

    pub fn run(command: impl Into<String>) -> Self {
        Step::Run(RunStep::new(command))
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Prompt { .. } => StepKind::Prompt,
            Step::Compact { .. } => StepKind::Compact,
            Step::Checkpoint { .. } => StepKind::Checkpoint,
            Step::Run(_) => StepKind::Run,
            Step::Verify { .. } => StepKind::Verify,
            Step::Pause { .. } => StepKind::Pause,
            Step::Consult { .. } => StepKind::Consult,
            Step::NewConversation => StepKind::NewConversation,
            Step::Elide => StepKind::Elide,
        }
    }

    /// Human-readable primary content of the step
    pub fn content(&self) -> &str {
        match self {
            Step::Prompt { content } => content,
            Step::Run(run) => &run.command,
            Step::Verify { verifier, .. } => verifier,
            Step::Pause { message } => message,
            Step::Consult { topic } => topic,
            Step::Checkpoint { name } => name.as_deref().unwrap_or_default(),
            Step::Compact { .. } | Step::NewConversation | Step::Elide => "",
        }
    }

    pub fn is_prompt(&self) -> bool {
        matches!(self, Step::Prompt { .. })
    }

    pub fn as_run(&self) -> Option<&RunStep> {
        match self {
            Step::Run(run) => Some(run),
            _ => None,
        }
    }

    pub fn as_run_mut(&mut self) -> Option<&mut RunStep> {
        match self {
            Step::Run(run) => Some(run),
            _ => None,
        }
    }
}
