//! Backend that pipes each prompt to an external command
//!
//! The command reads the prompt on stdin and writes the response to stdout.
//! Session identity is passed through the environment so a stateful wrapper
//! script can keep its own history. Exit code 75 (`EX_TEMPFAIL`) is read as
//! rate limiting.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Backend, BackendError, CompactionResult, ContextUsage, Session, SessionConfig, StreamEvent};
use crate::context::estimate_tokens;

/// Exit code the command uses to report rate limiting
pub const EXIT_RATE_LIMITED: i32 = 75;

/// Settings for the `exec` adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExecConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecBackend {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    workdir: Option<PathBuf>,
}

impl ExecBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
            workdir: None,
        }
    }

    pub fn from_config(config: &ExecConfig) -> Result<Self, BackendError> {
        let command = config
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| BackendError::Failed("exec adapter requires backend.exec.command in config".to_string()))?;
        Ok(Self::new(command, config.args.clone(), Duration::from_secs(config.timeout_secs)))
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    async fn invoke(
        &self,
        session: &Session,
        input: &str,
        events: Option<mpsc::UnboundedSender<StreamEvent>>,
    ) -> Result<String, BackendError> {
        debug!(command = %self.command, session_id = %session.id, input_len = input.len(), "ExecBackend::invoke: called");
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("CONVOLOOP_SESSION_ID", &session.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Failed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Failed("child stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Failed("child stderr unavailable".to_string()))?;

        // stdin is moved in and dropped so the child sees EOF
        let write_input = async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
            drop(stdin);
            Ok::<_, std::io::Error>(())
        };
        let read_output = async {
            let mut response = String::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(tx) = &events {
                    let _ = tx.send(StreamEvent::Chunk(format!("{}\n", line)));
                }
                response.push_str(&line);
                response.push('\n');
            }
            Ok::<_, std::io::Error>(response)
        };
        let read_errors = async {
            let mut errors = String::new();
            stderr.read_to_string(&mut errors).await?;
            Ok::<_, std::io::Error>(errors)
        };
        let run = async {
            let ((), response, errors) = tokio::try_join!(write_input, read_output, read_errors)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((response, errors, status))
        };

        let (response, errors, status) = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))??;

        match status.code() {
            Some(0) => Ok(response.trim_end().to_string()),
            Some(EXIT_RATE_LIMITED) => Err(BackendError::RateLimited { retry_after: None }),
            code => {
                warn!(?code, stderr = %errors.trim(), "Exec backend command failed");
                Err(BackendError::Failed(format!(
                    "{} exited with {:?}: {}",
                    self.command,
                    code,
                    errors.trim()
                )))
            }
        }
    }
}

#[async_trait]
impl Backend for ExecBackend {
    fn name(&self) -> &str {
        "exec"
    }

    async fn start(&self) -> Result<(), BackendError> {
        debug!(command = %self.command, "ExecBackend::start: called");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn create_session(&self, config: &SessionConfig) -> Result<Session, BackendError> {
        debug!(model = ?config.model, "ExecBackend::create_session: called");
        let id = Uuid::now_v7().to_string();
        Ok(Session {
            resume_handle: Some(id.clone()),
            id,
        })
    }

    async fn destroy_session(&self, session: &Session) -> Result<(), BackendError> {
        debug!(session_id = %session.id, "ExecBackend::destroy_session: called");
        Ok(())
    }

    async fn send(
        &self,
        session: &Session,
        prompt: &str,
        events: Option<mpsc::UnboundedSender<StreamEvent>>,
    ) -> Result<String, BackendError> {
        self.invoke(session, prompt, events).await
    }

    async fn get_context_usage(&self, _session: &Session) -> Result<Option<ContextUsage>, BackendError> {
        Ok(None)
    }

    async fn compact(
        &self,
        session: &Session,
        preserve: &[String],
        summary_prompt: &str,
    ) -> Result<CompactionResult, BackendError> {
        debug!(session_id = %session.id, preserve = preserve.len(), "ExecBackend::compact: called");
        let summary = self.invoke(session, summary_prompt, None).await?;
        Ok(CompactionResult {
            tokens_before: 0,
            tokens_after: estimate_tokens(&summary),
            summary,
        })
    }

    async fn resume_session(&self, handle: &str, _config: &SessionConfig) -> Result<Session, BackendError> {
        Ok(Session {
            id: handle.to_string(),
            resume_handle: Some(handle.to_string()),
        })
    }
}
