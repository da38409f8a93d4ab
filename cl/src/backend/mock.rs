//! Scripted backend for dry runs and tests

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{Backend, BackendError, CompactionResult, ContextUsage, Session, SessionConfig, StreamEvent};
use crate::context::estimate_tokens;

/// Settings for the `mock` adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MockConfig {
    /// Replies returned in order before falling back to the echo reply
    pub responses: Vec<String>,
}

/// One scripted outcome of `send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Text(String),
    WithReasoning { reasoning: String, text: String },
    RateLimited(Option<Duration>),
    Abort(String),
    Fail(String),
}

impl From<&str> for MockReply {
    fn from(text: &str) -> Self {
        MockReply::Text(text.to_string())
    }
}

impl From<String> for MockReply {
    fn from(text: String) -> Self {
        MockReply::Text(text)
    }
}

/// Backend that replays a script, then echoes prompts back
///
/// Everything sent is recorded so tests can assert on the exact prompt text.
#[derive(Debug, Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<MockReply>>,
    sent: Mutex<Vec<String>>,
    usage: Mutex<Option<ContextUsage>>,
    sessions_created: AtomicUsize,
    sessions_destroyed: AtomicUsize,
    compactions: AtomicUsize,
    replies: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted<I, R>(replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<MockReply>,
    {
        let script: VecDeque<MockReply> = replies.into_iter().map(Into::into).collect();
        debug!(reply_count = script.len(), "MockBackend::scripted: called");
        Self {
            script: Mutex::new(script),
            ..Default::default()
        }
    }

    pub fn from_config(config: &MockConfig) -> Self {
        Self::scripted(config.responses.iter().cloned())
    }

    /// Report this usage from `get_context_usage`
    pub fn with_usage(self, used: usize, max: usize) -> Self {
        if let Ok(mut usage) = self.usage.lock() {
            *usage = Some(ContextUsage { used, max });
        }
        self
    }

    /// Append more replies to the script
    pub fn push_reply(&self, reply: impl Into<MockReply>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply.into());
        }
    }

    /// Every prompt sent so far, in order
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_destroyed(&self) -> usize {
        self.sessions_destroyed.load(Ordering::SeqCst)
    }

    pub fn compactions(&self) -> usize {
        self.compactions.load(Ordering::SeqCst)
    }

    fn next_reply(&self, prompt: &str) -> MockReply {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| {
            let n = self.replies.load(Ordering::SeqCst);
            MockReply::Text(format!(
                "Mock reply #{} to a prompt of {} characters. This adapter does not contact a model; \
                 it echoes the prompt so workflows can be exercised end to end.\n\n{}",
                n,
                prompt.chars().count(),
                prompt
            ))
        })
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self) -> Result<(), BackendError> {
        debug!("MockBackend::start: called");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        debug!("MockBackend::stop: called");
        Ok(())
    }

    async fn create_session(&self, config: &SessionConfig) -> Result<Session, BackendError> {
        debug!(model = ?config.model, "MockBackend::create_session: called");
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        let id = Uuid::now_v7().to_string();
        Ok(Session {
            resume_handle: Some(id.clone()),
            id,
        })
    }

    async fn destroy_session(&self, session: &Session) -> Result<(), BackendError> {
        debug!(session_id = %session.id, "MockBackend::destroy_session: called");
        self.sessions_destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        session: &Session,
        prompt: &str,
        events: Option<mpsc::UnboundedSender<StreamEvent>>,
    ) -> Result<String, BackendError> {
        debug!(session_id = %session.id, prompt_len = prompt.len(), "MockBackend::send: called");
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(prompt.to_string());
        }

        let (reasoning, text) = match self.next_reply(prompt) {
            MockReply::Text(text) => (None, text),
            MockReply::WithReasoning { reasoning, text } => (Some(reasoning), text),
            MockReply::RateLimited(retry_after) => return Err(BackendError::RateLimited { retry_after }),
            MockReply::Abort(message) => return Err(BackendError::Aborted(message)),
            MockReply::Fail(message) => return Err(BackendError::Failed(message)),
        };
        self.replies.fetch_add(1, Ordering::SeqCst);

        if let Some(tx) = events {
            if let Some(reasoning) = reasoning {
                let _ = tx.send(StreamEvent::Reasoning(reasoning));
            }
            let _ = tx.send(StreamEvent::Chunk(text.clone()));
        }
        Ok(text)
    }

    async fn get_context_usage(&self, _session: &Session) -> Result<Option<ContextUsage>, BackendError> {
        Ok(self.usage.lock().ok().and_then(|u| *u))
    }

    async fn compact(
        &self,
        session: &Session,
        preserve: &[String],
        summary_prompt: &str,
    ) -> Result<CompactionResult, BackendError> {
        debug!(session_id = %session.id, preserve = preserve.len(), "MockBackend::compact: called");
        self.compactions.fetch_add(1, Ordering::SeqCst);
        let tokens_before: usize = self
            .sent
            .lock()
            .map(|s| s.iter().map(|p| estimate_tokens(p)).sum())
            .unwrap_or_default();
        let mut summary = format!("Summary of {} prompts.", self.replies.load(Ordering::SeqCst));
        if !preserve.is_empty() {
            summary.push_str(&format!(" Preserved: {}.", preserve.join(", ")));
        }
        debug!(instruction_len = summary_prompt.len(), "MockBackend::compact: summarized");
        Ok(CompactionResult {
            tokens_after: estimate_tokens(&summary),
            summary,
            tokens_before,
        })
    }

    async fn resume_session(&self, handle: &str, _config: &SessionConfig) -> Result<Session, BackendError> {
        debug!(%handle, "MockBackend::resume_session: called");
        Ok(Session {
            id: handle.to_string(),
            resume_handle: Some(handle.to_string()),
        })
    }

    async fn delete_session(&self, handle: &str) -> Result<(), BackendError> {
        debug!(%handle, "MockBackend::delete_session: called");
        Ok(())
    }
}
