//! ExecutionEngine - runs a workflow's cycles and steps against a backend

use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::command::{CommandOutput, CommandSpec, run_command};
use super::error::EngineError;
use super::state::{CheckpointRef, ExecutionState, ExecutionStatus, Message, Role};
use super::verify::{Verifier, VerifierRegistry};
use crate::backend::{Backend, BackendError, Session, SessionConfig, StreamEvent};
use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore, PAUSE_RECORD_TYPE, PauseReason, PauseRecord};
use crate::context::{
    ContextError, ContextLoader, ContextTracker, ContextWindow, DEFAULT_MAX_TOKENS, FileFilter, PreCycleAction,
    SessionMode, compaction_prompt,
};
use crate::detector::{LoopDetector, LoopDetectorConfig};
use crate::workflow::{
    CheckpointPolicy, ContextLimitAction, OutputPolicy, PromptVars, Provenance, RunOnError, RunStep, Step,
    TemplateRenderer, VerifyOnError, WorkflowDefinition,
};

/// Base directory for session checkpoint directories
pub const DEFAULT_CHECKPOINT_DIR: &str = ".convoloop/checkpoints";

const DEFAULT_RETRY_PROMPT: &str = "The command below failed. Fix the cause so that it succeeds.";

/// Continue to the next step, or stop with an outcome
macro_rules! proceed {
    ($flow:expr) => {
        match $flow {
            ControlFlow::Continue(value) => value,
            ControlFlow::Break(outcome) => return Ok(ControlFlow::Break(outcome)),
        }
    };
}

/// Environment-level settings for one engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Directory commands run in and context patterns resolve against
    pub workdir: PathBuf,
    /// Base directory; each session gets its own subdirectory
    pub checkpoint_dir: PathBuf,
    pub max_tokens: usize,
    pub loop_detection: LoopDetectorConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            max_tokens: DEFAULT_MAX_TOKENS,
            loop_detection: LoopDetectorConfig::default(),
        }
    }
}

/// How a run ended without an error
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// Stopped with a pause record that `resume` can pick up
    Paused {
        reason: PauseReason,
        message: String,
        checkpoint: PathBuf,
        retry_after: Option<Duration>,
    },
}

type Flow<T = ()> = Result<ControlFlow<RunOutcome, T>, EngineError>;

struct PendingConsult {
    topic: String,
    expired: bool,
}

/// Drives one workflow execution
///
/// The engine owns its state, tracker and checkpoint store. Steps run
/// strictly in order with at most one prompt in flight.
pub struct ExecutionEngine {
    workflow: WorkflowDefinition,
    backend: Arc<dyn Backend>,
    state: ExecutionState,
    tracker: ContextTracker,
    loader: ContextLoader,
    store: CheckpointStore,
    detector: LoopDetector,
    verifiers: VerifierRegistry,
    renderer: TemplateRenderer,
    workdir: PathBuf,
    stop: Arc<AtomicBool>,
    events: Option<mpsc::UnboundedSender<StreamEvent>>,
    session: Option<Session>,
    resume_handle: Option<String>,
    /// Elided prompts and command output waiting for the next sent prompt
    pending: Vec<String>,
    context_sent: bool,
    /// Restored conversation a new backend session has not seen yet
    replay_history: bool,
    /// Step to start the current cycle from after a resume
    resume_from: Option<usize>,
    consult: Option<PendingConsult>,
}

impl ExecutionEngine {
    pub fn new(
        workflow: WorkflowDefinition,
        backend: Arc<dyn Backend>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        debug!(workflow = %workflow.name(), adapter = backend.name(), "ExecutionEngine::new: called");
        let workdir = match &workflow.cwd {
            Some(cwd) if cwd.is_absolute() => cwd.clone(),
            Some(cwd) => options.workdir.join(cwd),
            None => options.workdir.clone(),
        };
        let workflow_dir = workflow.source_path().map(|_| workflow.base_dir());
        let mut filter = FileFilter::new(&workflow.file_rules, &workflow.context.excluded)?.with_root(workdir.clone());
        if let Some(dir) = &workflow_dir {
            filter = filter.with_root(dir.clone());
        }
        let tracker = ContextTracker::new(ContextWindow::new(options.max_tokens, workflow.context_limit), filter);
        let loader = ContextLoader::new(workdir.clone(), workflow_dir);
        let state = ExecutionState::generate();
        let store = CheckpointStore::for_session(&options.checkpoint_dir, &state.session_id);
        let verifiers = VerifierRegistry::with_builtins(Duration::from_secs(workflow.run.timeout_secs));

        Ok(Self {
            workflow,
            backend,
            state,
            tracker,
            loader,
            store,
            detector: LoopDetector::new(options.loop_detection),
            verifiers,
            renderer: TemplateRenderer::new(),
            workdir,
            stop: Arc::new(AtomicBool::new(false)),
            events: None,
            session: None,
            resume_handle: None,
            pending: Vec::new(),
            context_sent: false,
            replay_history: false,
            resume_from: None,
            consult: None,
        })
    }

    /// Forward streamed backend output to `tx`
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Share a stop flag; setting it stops the run before the next step
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifiers.register(verifier);
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn tracker(&self) -> &ContextTracker {
        &self.tracker
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    /// Put a fresh engine back into the position a pause record describes
    pub(crate) fn restore(&mut self, record: PauseRecord, store: CheckpointStore) {
        debug!(session_id = %record.session_id, status = %record.status, reason = %record.reason, "ExecutionEngine::restore: called");
        let consulting = record.status == ExecutionStatus::Consulting;
        let expired = record.is_expired(Utc::now());
        let resume_from = match record.step_index {
            Some(idx) if record.reason.resumes_after_step() => idx + 1,
            Some(idx) => idx,
            None => self.workflow.resume_step(record.prompt_index),
        };

        if record.context_status.max_tokens > 0 {
            self.tracker.restore_status(&record.context_status);
        } else {
            for message in record.messages.iter().filter(|m| m.role != Role::System) {
                self.tracker.add_conversation_turn(&message.content);
            }
        }
        self.context_sent = !record.messages.is_empty();
        self.replay_history = !record.messages.is_empty();
        self.store = store;
        self.state.session_id = record.session_id;
        self.state.cycle_number = record.cycle_number;
        self.state.prompt_index = record.prompt_index;
        self.state.replace_messages(record.messages);
        self.resume_handle = record.backend_resume_handle;
        self.resume_from = Some(resume_from);

        if consulting {
            self.state.restore_status(ExecutionStatus::Consulting);
            self.consult = Some(PendingConsult {
                topic: record.message,
                expired,
            });
        } else {
            self.state.restore_status(ExecutionStatus::Resumed);
        }
    }

    /// Run until the workflow completes, pauses or fails
    pub async fn run(&mut self) -> Result<RunOutcome, EngineError> {
        info!(
            session_id = %self.state.session_id,
            workflow = %self.workflow.name(),
            adapter = self.backend.name(),
            max_cycles = self.workflow.max_cycles,
            "Starting workflow"
        );
        match self.state.status() {
            ExecutionStatus::Pending => self.enter(ExecutionStatus::Running)?,
            ExecutionStatus::Consulting => self.enter(ExecutionStatus::Resumed)?,
            ExecutionStatus::Resumed => {}
            other => {
                return Err(EngineError::InvalidTransition {
                    from: other,
                    to: ExecutionStatus::Running,
                });
            }
        }

        self.setup().await?;
        if self.state.status() == ExecutionStatus::Resumed {
            self.enter(ExecutionStatus::Running)?;
        }

        if let Some(consult) = self.consult.take()
            && let ControlFlow::Break(outcome) = self.send_consult_followup(consult).await?
        {
            return Ok(outcome);
        }

        match self.run_cycles().await? {
            ControlFlow::Break(outcome) => Ok(outcome),
            ControlFlow::Continue(()) => {
                self.complete().await?;
                Ok(RunOutcome::Completed)
            }
        }
    }

    async fn setup(&mut self) -> Result<(), EngineError> {
        debug!(session_id = %self.state.session_id, "ExecutionEngine::setup: called");
        if let Err(e) = self.backend.start().await {
            return Err(self.step_failed(None, "start backend".to_string(), e.to_string()));
        }
        if let Err(e) = self.open_session().await {
            return Err(self.step_failed(None, "create session".to_string(), e.to_string()));
        }
        self.load_context()
    }

    async fn run_cycles(&mut self) -> Flow {
        while self.state.cycle_number < self.workflow.max_cycles {
            let resumed_at = self.resume_from;
            if resumed_at.is_none() {
                self.state.prompt_index = 0;
                info!(
                    cycle = self.state.cycle_number + 1,
                    max_cycles = self.workflow.max_cycles,
                    "Starting cycle"
                );
                proceed!(self.before_cycle().await?);
            }

            for idx in resumed_at.unwrap_or(0)..self.workflow.steps.len() {
                if self.stop.load(Ordering::SeqCst) {
                    info!(step = idx, "Stop requested, pausing before next step");
                    return self.pause(Some(idx), PauseReason::Stopped, "Stopped by request".to_string(), None, None);
                }
                if self.workflow.checkpoints.after == CheckpointPolicy::EachPrompt {
                    self.checkpoint_step(Some(idx), None)?;
                }
                let step = self.workflow.steps[idx].clone();
                let next_is_elide = matches!(self.workflow.steps.get(idx + 1), Some(Step::Elide));
                proceed!(self.execute_step(idx, &step, next_is_elide).await?);
            }

            self.resume_from = None;
            self.state.cycle_number += 1;
            self.state.prompt_index = 0;
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn before_cycle(&mut self) -> Flow {
        let cycle = self.state.cycle_number;
        debug!(cycle, mode = %self.workflow.mode, "ExecutionEngine::before_cycle: called");
        let preserve = self.workflow.compaction_preserve();

        match self.workflow.mode.pre_cycle_action(cycle) {
            PreCycleAction::Compact => proceed!(self.compact(None, &preserve).await?),
            PreCycleAction::FreshSession => self.fresh_session().await?,
            PreCycleAction::None => {}
        }

        if matches!(self.workflow.mode, SessionMode::Accumulate)
            && self.tracker.needs_compaction(self.workflow.compaction.min_density)
        {
            match self.workflow.on_context_limit {
                ContextLimitAction::Compact => {
                    info!(
                        usage = self.tracker.window().usage_percent(),
                        "Context near limit, compacting"
                    );
                    proceed!(self.compact(None, &preserve).await?);
                }
                ContextLimitAction::Stop => return self.stop_at_context_limit().await,
            }
        }

        if self.workflow.checkpoints.after == CheckpointPolicy::EachCycle && self.state.prompt_index == 0 && cycle > 0 {
            self.checkpoint_step(None, None)?;
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn execute_step(&mut self, idx: usize, step: &Step, next_is_elide: bool) -> Flow {
        debug!(idx, kind = %step.kind(), "ExecutionEngine::execute_step: called");
        match step {
            Step::Run(run) => self.execute_run(idx, run).await,
            other => self.execute(idx, other, true, next_is_elide).await,
        }
    }

    /// Execute one step; `anchor` is the top-level step it belongs to
    async fn execute(&mut self, anchor: usize, step: &Step, top_level: bool, next_is_elide: bool) -> Flow {
        match step {
            Step::Prompt { content } => self.execute_prompt(anchor, content, top_level, next_is_elide).await,
            Step::Compact { preserve } => self.compact(Some(anchor), preserve).await,
            Step::Checkpoint { name } => {
                self.checkpoint_step(Some(anchor), name.as_deref())?;
                Ok(ControlFlow::Continue(()))
            }
            Step::Run(run) => {
                let output = proceed!(self.run_with_retries(anchor, run).await?);
                if output.success() {
                    Ok(ControlFlow::Continue(()))
                } else {
                    self.run_failed(anchor, &run.command, &output)
                }
            }
            Step::Verify { verifier, args } => self.execute_verify(anchor, verifier, args).await,
            Step::Pause { message } => {
                let message = self.render_text(message);
                self.pause(Some(anchor), PauseReason::Gate, message, None, None)
            }
            Step::Consult { topic } => {
                let expires_at = self.workflow.consult_timeout_secs.and_then(consult_deadline);
                let topic = self.render_text(topic);
                self.pause(Some(anchor), PauseReason::Consult, topic, None, expires_at)
            }
            Step::NewConversation => {
                info!(session_id = %self.state.session_id, "Starting a new conversation");
                self.close_session().await;
                self.replay_history = false;
                if let Err(e) = self.open_session().await {
                    return self.backend_failed(Some(anchor), "new conversation", e);
                }
                self.context_sent = false;
                Ok(ControlFlow::Continue(()))
            }
            Step::Elide => Ok(ControlFlow::Continue(())),
        }
    }

    async fn execute_prompt(&mut self, anchor: usize, content: &str, top_level: bool, next_is_elide: bool) -> Flow {
        let first = top_level && self.state.prompt_index == 0;
        let last = top_level && self.workflow.steps.iter().rposition(Step::is_prompt) == Some(anchor);

        let mut parts: Vec<String> = Vec::new();
        if first {
            parts.extend(self.workflow.injection.prologues.iter().cloned());
        }
        parts.push(content.to_string());
        if last {
            parts.extend(self.workflow.injection.epilogues.iter().cloned());
        }
        let text = self.render_text(&parts.join("\n\n"));

        if next_is_elide {
            debug!(anchor, "execute_prompt: elided into the next prompt");
            self.pending.push(text);
        } else {
            proceed!(self.send_prompt(Some(anchor), text).await?);
        }
        if top_level {
            self.state.prompt_index += 1;
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Send a prompt with everything queued ahead of it and record the exchange
    async fn send_prompt(&mut self, anchor: Option<usize>, text: String) -> Flow<String> {
        let session = match self.current_session().await {
            Ok(session) => session,
            Err(e) => return self.backend_failed(anchor, "prompt", e),
        };
        let mut sections: Vec<String> = Vec::new();
        if !self.context_sent {
            sections.extend(self.tracker.context_block());
            if !self.workflow.refcat.is_empty() {
                let mut catalog = String::from("# Reference catalog\n");
                for entry in &self.workflow.refcat {
                    catalog.push_str(&format!("- {}\n", entry));
                }
                sections.push(catalog);
            }
        }
        if self.replay_history {
            sections.push(self.transcript());
        }
        sections.extend(self.pending.iter().cloned());
        sections.push(text);
        let prompt = sections.join("\n\n");
        debug!(session_id = %session.id, prompt_len = prompt.len(), "ExecutionEngine::send_prompt: sending");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = self.backend.send(&session, &prompt, Some(tx)).await;
        let mut reasoning = String::new();
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Reasoning(chunk) = &event {
                reasoning.push_str(chunk);
            }
            if let Some(events) = &self.events {
                let _ = events.send(event);
            }
        }
        let response = match result {
            Ok(response) => response,
            Err(e) => return self.backend_failed(anchor, "prompt", e),
        };

        self.context_sent = true;
        self.replay_history = false;
        self.pending.clear();
        self.tracker.add_conversation_turn(&prompt);
        self.tracker.add_conversation_turn(&response);
        let cycle = self.state.cycle_number;
        let prompt_index = self.state.prompt_index;
        self.state.push_message(
            Message::user(prompt)
                .with_metadata("cycle", cycle)
                .with_metadata("prompt_index", prompt_index),
        );
        self.state
            .push_message(Message::assistant(response.clone()).with_metadata("cycle", cycle));
        self.refresh_usage(&session).await;

        let reasoning = (!reasoning.is_empty()).then_some(reasoning.as_str());
        if let Some(signal) = self.detector.check(reasoning, &response, cycle) {
            let message = format!("{}: {}", signal.reason, signal.detail);
            let checkpoint = self.fail(anchor, PauseReason::LoopDetected, &message)?;
            return Err(EngineError::LoopDetected {
                reason: signal.reason,
                detail: signal.detail,
                checkpoint,
            });
        }
        Ok(ControlFlow::Continue(response))
    }

    async fn send_consult_followup(&mut self, consult: PendingConsult) -> Flow {
        info!(topic = %consult.topic, expired = consult.expired, "Resuming after consultation");
        let text = if consult.expired {
            format!(
                "The consultation on \"{}\" timed out without guidance. Continue the workflow using your best judgment.",
                consult.topic
            )
        } else {
            format!(
                "The consultation on \"{}\" is complete. Take the guidance into account and continue the workflow.",
                consult.topic
            )
        };
        proceed!(self.send_prompt(None, text).await?);
        Ok(ControlFlow::Continue(()))
    }

    async fn execute_run(&mut self, idx: usize, run: &RunStep) -> Flow {
        let output = proceed!(self.run_with_retries(idx, run).await?);
        let passed = output.success();
        let block = if passed { &run.on_success } else { &run.on_failure };
        if !passed && block.is_empty() {
            return self.run_failed(idx, &run.command, &output);
        }

        if !block.is_empty() {
            debug!(idx, passed, steps = block.len(), "execute_run: running attached block");
        }
        for (pos, step) in block.iter().enumerate() {
            let next_is_elide = matches!(block.get(pos + 1), Some(Step::Elide));
            proceed!(self.execute(idx, step, false, next_is_elide).await?);
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Run a command, asking the backend to fix failures up to `retry_count` times
    async fn run_with_retries(&mut self, anchor: usize, run: &RunStep) -> Flow<CommandOutput> {
        let command = self.render_text(&run.command);
        let spec = self.command_spec(&command);
        info!(%command, "Running command");
        let mut output = run_command(&spec).await;

        let mut attempt = 0;
        while !output.success() && attempt < run.retry_count {
            attempt += 1;
            warn!(%command, attempt, retries = run.retry_count, exit_code = output.exit_code, "Command failed, asking backend to fix it");
            let instruction = run
                .retry_prompt
                .as_deref()
                .map(|p| self.render_text(p))
                .unwrap_or_else(|| DEFAULT_RETRY_PROMPT.to_string());
            let text = format!("{}\n\n{}", instruction, output.render(&command));
            proceed!(self.send_prompt(Some(anchor), text).await?);
            output = run_command(&spec).await;
        }

        let policy = self.workflow.run.output;
        self.record_output("run", output.render(&command), !output.success(), policy);
        Ok(ControlFlow::Continue(output))
    }

    fn run_failed(&mut self, anchor: usize, command: &str, output: &CommandOutput) -> Flow {
        let reason = if output.timed_out {
            "timed out".to_string()
        } else {
            format!("exited with code {}", output.exit_code)
        };
        match self.workflow.run.on_error {
            RunOnError::Continue => {
                warn!(%command, %reason, "Command failed, continuing");
                Ok(ControlFlow::Continue(()))
            }
            RunOnError::Stop => Err(self.step_failed(Some(anchor), format!("RUN {}", command), reason)),
        }
    }

    async fn execute_verify(&mut self, anchor: usize, name: &str, args: &str) -> Flow {
        let Some(verifier) = self.verifiers.get(name) else {
            let message = format!("unknown verifier (available: {})", self.verifiers.names().join(", "));
            return Err(self.step_failed(Some(anchor), format!("VERIFY {}", name), message));
        };
        let args = self.render_text(args);
        let outcome = verifier.verify(&args, &self.workdir).await;
        info!(verifier = name, passed = outcome.passed, "Verification finished");

        let policy = self.workflow.verify.output;
        let text = format!("verify {} {}\n{}", name, args, outcome.output.trim_end());
        self.record_output("verify", text, !outcome.passed, policy);
        if outcome.passed {
            return Ok(ControlFlow::Continue(()));
        }
        match self.workflow.verify.on_error {
            VerifyOnError::Continue => {
                warn!(verifier = name, "Verification failed, continuing");
                Ok(ControlFlow::Continue(()))
            }
            VerifyOnError::Fail => Err(self.step_failed(
                Some(anchor),
                format!("VERIFY {}", name),
                outcome.output.trim().to_string(),
            )),
        }
    }

    /// Queue command or verifier output for the next prompt
    fn record_output(&mut self, source: &str, text: String, failed: bool, policy: OutputPolicy) {
        if !policy.includes(failed) {
            return;
        }
        self.state
            .push_message(Message::system(text.clone()).with_metadata("source", source));
        self.pending.push(text);
    }

    fn command_spec(&self, command: &str) -> CommandSpec {
        let cwd = match &self.workflow.run.cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.workdir.join(dir),
            None => self.workdir.clone(),
        };
        let mut spec = CommandSpec::new(command, cwd, Duration::from_secs(self.workflow.run.timeout_secs));
        spec.env = self.workflow.run.env.clone();
        spec.env
            .insert("CONVOLOOP_SESSION_ID".to_string(), self.state.session_id.clone());
        spec.env
            .insert("CONVOLOOP_CYCLE".to_string(), (self.state.cycle_number + 1).to_string());
        spec
    }

    async fn compact(&mut self, anchor: Option<usize>, preserve: &[String]) -> Flow {
        let instruction = compaction_prompt(preserve, self.workflow.compaction.summary.as_deref());
        let instruction = self.render_text(&instruction);
        let session = match self.current_session().await {
            Ok(session) => session,
            Err(e) => return self.backend_failed(anchor, "compact", e),
        };
        let before = self.tracker.used_tokens();
        let result = match self.backend.compact(&session, preserve, &instruction).await {
            Ok(result) => result,
            Err(e) => return self.backend_failed(anchor, "compact", e),
        };

        self.state
            .push_message(Message::system(result.summary.clone()).with_metadata("compaction", true));
        match self.backend.get_context_usage(&session).await {
            Ok(Some(usage)) => self.tracker.set_usage(usage.used, usage.max),
            _ if result.tokens_after > 0 => self.tracker.set_usage(result.tokens_after, 0),
            _ => {}
        }
        info!(before, after = self.tracker.used_tokens(), "Compacted conversation");
        Ok(ControlFlow::Continue(()))
    }

    async fn stop_at_context_limit(&mut self) -> Flow {
        let usage = self.tracker.window().usage_percent();
        warn!(usage, "Context limit reached, stopping");
        if let Some(prompt) = self.workflow.on_context_limit_prompt.clone() {
            let text = self.render_text(&prompt);
            proceed!(self.send_prompt(None, text).await?);
        }
        let message = format!("Context limit reached ({:.0}% used)", usage * 100.0);
        self.pause(None, PauseReason::ContextLimit, message, None, None)
    }

    async fn fresh_session(&mut self) -> Result<(), EngineError> {
        info!(cycle = self.state.cycle_number + 1, "Starting fresh backend session");
        self.close_session().await;
        self.replay_history = false;
        if let Err(e) = self.open_session().await {
            return Err(self.step_failed(None, "fresh session".to_string(), e.to_string()));
        }
        self.tracker.clear_files();
        self.load_context()?;
        self.context_sent = false;
        Ok(())
    }

    fn load_context(&mut self) -> Result<(), EngineError> {
        if self.workflow.context.is_empty() {
            return Ok(());
        }
        match self.loader.load(&mut self.tracker, &self.workflow.context) {
            Ok(report) => {
                info!(
                    loaded = report.loaded.len(),
                    skipped = report.skipped.len(),
                    tokens = self.tracker.used_tokens(),
                    "Loaded context files"
                );
                Ok(())
            }
            Err(ContextError::MissingContextFiles { missing }) => {
                let message = format!("{} required context file(s) missing", missing.len());
                let checkpoint = self.fail(None, PauseReason::MissingContext, &message)?;
                Err(EngineError::MissingContextFiles { missing, checkpoint })
            }
            Err(e) => Err(self.step_failed(None, "load context".to_string(), e.to_string())),
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.workflow.model.clone(),
            workdir: self.workdir.clone(),
            allow_files: self.workflow.file_rules.allow.clone(),
            deny_files: self.workflow.file_rules.deny.clone(),
        }
    }

    async fn open_session(&mut self) -> Result<(), BackendError> {
        if self.session.is_some() {
            return Ok(());
        }
        let config = self.session_config();
        if let Some(handle) = self.resume_handle.take() {
            match self.backend.resume_session(&handle, &config).await {
                Ok(session) => {
                    info!(session = %session.id, "Reattached backend session");
                    self.session = Some(session);
                    self.replay_history = false;
                    return Ok(());
                }
                Err(e) => {
                    warn!(%handle, error = %e, "Could not reattach backend session, starting a new one");
                }
            }
        }
        let session = self.backend.create_session(&config).await?;
        debug!(session = %session.id, replay = self.replay_history, "open_session: created backend session");
        self.session = Some(session);
        self.context_sent = false;
        Ok(())
    }

    /// Restored messages since the last compaction, rendered for a new session
    fn transcript(&self) -> String {
        let messages = self.state.messages();
        let start = messages
            .iter()
            .rposition(|m| m.metadata.contains_key("compaction"))
            .unwrap_or(0);
        let mut out = String::from("# Conversation so far\n");
        for message in &messages[start..] {
            let heading = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System if message.metadata.contains_key("compaction") => "Summary",
                Role::System => continue,
            };
            out.push_str(&format!("\n## {}\n\n{}\n", heading, message.content.trim_end()));
        }
        out
    }

    async fn current_session(&mut self) -> Result<Session, BackendError> {
        self.open_session().await?;
        self.session
            .clone()
            .ok_or_else(|| BackendError::SessionNotFound("no active session".to_string()))
    }

    /// Destroy the backend session; failures are logged and ignored
    async fn close_session(&mut self) {
        if let Some(session) = self.session.take()
            && let Err(e) = self.backend.destroy_session(&session).await
        {
            warn!(session = %session.id, error = %e, "Failed to destroy backend session");
        }
    }

    async fn refresh_usage(&mut self, session: &Session) {
        match self.backend.get_context_usage(session).await {
            Ok(Some(usage)) => self.tracker.set_usage(usage.used, usage.max),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read context usage from backend"),
        }
    }

    /// Write a named checkpoint of the current state
    pub fn create_checkpoint(&mut self, name: Option<&str>) -> Result<PathBuf, EngineError> {
        let name = match name.map(str::to_string).or_else(|| self.workflow.checkpoints.name.clone()) {
            Some(name) => self.render_text(&name),
            None => format!("checkpoint-{}", self.state.checkpoints.len() + 1),
        };
        let mut checkpoint = Checkpoint::new(name, self.state.cycle_number);
        checkpoint.metadata = CheckpointMetadata {
            prompt_index: self.state.prompt_index,
            workflow_path: self.workflow.source_path().map(Path::to_path_buf),
        };
        checkpoint.messages = self.state.messages().to_vec();
        checkpoint.context_status = self.tracker.status();

        let path = self.store.create_checkpoint(&checkpoint)?;
        debug!(name = %checkpoint.name, "create_checkpoint: recorded reference");
        self.state.checkpoints.push(CheckpointRef {
            id: checkpoint.id,
            name: checkpoint.name,
            path: path.clone(),
            timestamp: checkpoint.timestamp,
        });
        Ok(path)
    }

    /// Write a checkpoint the workflow asked for, failing the run if it cannot be stored
    fn checkpoint_step(&mut self, anchor: Option<usize>, name: Option<&str>) -> Result<PathBuf, EngineError> {
        match self.create_checkpoint(name) {
            Ok(path) => Ok(path),
            Err(e) => Err(self.step_failed(anchor, "CHECKPOINT".to_string(), e.to_string())),
        }
    }

    /// Move to `status`, failing the run with a pause record if the move is illegal
    fn enter(&mut self, status: ExecutionStatus) -> Result<(), EngineError> {
        match self.state.transition(status) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.step_failed(None, format!("enter {}", status), e.to_string())),
        }
    }

    fn pause<T>(
        &mut self,
        anchor: Option<usize>,
        reason: PauseReason,
        message: String,
        retry_after: Option<Duration>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Flow<T> {
        let status = if reason == PauseReason::Consult {
            ExecutionStatus::Consulting
        } else {
            ExecutionStatus::Paused
        };
        self.state.transition(status)?;
        let checkpoint = self.write_pause(anchor, reason, message.clone(), expires_at)?;
        info!(%reason, %message, checkpoint = %checkpoint.display(), "Execution paused");
        Ok(ControlFlow::Break(RunOutcome::Paused {
            reason,
            message,
            checkpoint,
            retry_after,
        }))
    }

    /// Mark the run failed and write the pause record it can resume from
    fn fail(&mut self, anchor: Option<usize>, reason: PauseReason, message: &str) -> Result<PathBuf, EngineError> {
        let status = self.state.status();
        if status != ExecutionStatus::Failed && self.state.transition(ExecutionStatus::Failed).is_err() {
            warn!(from = %status, "Forcing failed status");
            self.state.restore_status(ExecutionStatus::Failed);
        }
        let checkpoint = self.write_pause(anchor, reason, message.to_string(), None)?;
        warn!(%reason, %message, checkpoint = %checkpoint.display(), "Execution failed");
        Ok(checkpoint)
    }

    fn step_failed(&mut self, anchor: Option<usize>, step: String, message: String) -> EngineError {
        match self.fail(anchor, PauseReason::StepFailed, &message) {
            Ok(checkpoint) => EngineError::StepFailed {
                step,
                message,
                checkpoint,
            },
            Err(e) => e,
        }
    }

    fn backend_failed<T>(&mut self, anchor: Option<usize>, step: &str, error: BackendError) -> Flow<T> {
        match error {
            BackendError::RateLimited { retry_after } => {
                warn!(?retry_after, "Backend rate limited, pausing");
                let message = BackendError::RateLimited { retry_after }.to_string();
                self.pause(anchor, PauseReason::RateLimited, message, retry_after, None)
            }
            BackendError::Aborted(message) => {
                let checkpoint = self.fail(anchor, PauseReason::BackendAborted, &message)?;
                Err(EngineError::BackendAborted { message, checkpoint })
            }
            other => Err(self.step_failed(anchor, step.to_string(), other.to_string())),
        }
    }

    fn write_pause(
        &self,
        anchor: Option<usize>,
        reason: PauseReason,
        message: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<PathBuf, EngineError> {
        let (workflow_path, workflow_content) = match &self.workflow.source {
            Provenance::File(path) => (Some(path.clone()), None),
            Provenance::Inline(_) => (None, Some(self.workflow.to_source())),
        };
        let record = PauseRecord {
            record_type: PAUSE_RECORD_TYPE.to_string(),
            message,
            reason,
            status: self.state.status(),
            timestamp: Utc::now(),
            session_id: self.state.session_id.clone(),
            backend_resume_handle: self
                .session
                .as_ref()
                .and_then(|s| s.resume_handle.clone())
                .or_else(|| self.resume_handle.clone()),
            workflow_path,
            workflow_content,
            cycle_number: self.state.cycle_number,
            prompt_index: self.state.prompt_index,
            step_index: anchor.or(self.resume_from),
            messages: self.state.messages().to_vec(),
            context_status: self.tracker.status(),
            expires_at,
        };
        Ok(self.store.save_pause(&record)?)
    }

    async fn complete(&mut self) -> Result<(), EngineError> {
        self.write_output_file()?;
        self.state.transition(ExecutionStatus::Completed)?;
        self.close_session().await;
        if let Err(e) = self.backend.stop().await {
            warn!(error = %e, "Failed to stop backend");
        }
        info!(
            session_id = %self.state.session_id,
            cycles = self.state.cycle_number,
            messages = self.state.messages().len(),
            "Workflow completed"
        );
        Ok(())
    }

    fn write_output_file(&mut self) -> Result<(), EngineError> {
        let Some(path) = self.workflow.output_file.clone() else {
            return Ok(());
        };
        let path = if path.is_absolute() { path } else { self.workdir.join(path) };

        let mut sections: Vec<String> = self
            .workflow
            .injection
            .headers
            .iter()
            .map(|h| self.render_text(h))
            .collect();
        sections.push(self.state.last_response().unwrap_or_default().to_string());
        sections.extend(self.workflow.injection.footers.iter().map(|f| self.render_text(f)));
        let mut body = sections.join("\n\n");
        body.push('\n');

        let written = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
        .and_then(|_| fs::write(&path, body));
        if let Err(e) = written {
            let message = format!("{}: {}", path.display(), e);
            return Err(self.step_failed(None, "OUTPUT-FILE".to_string(), message));
        }
        info!(path = %path.display(), "Wrote output file");
        Ok(())
    }

    fn prompt_vars(&self) -> PromptVars {
        PromptVars {
            cycle_number: self.state.cycle_number + 1,
            max_cycles: self.workflow.max_cycles,
            session_id: self.state.session_id.clone(),
            workflow_name: self.workflow.name(),
            date: Utc::now().format("%Y-%m-%d").to_string(),
        }
    }

    fn render_text(&self, text: &str) -> String {
        match self.renderer.render(text, &self.prompt_vars()) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(error = %e, "Template rendering failed, using text as written");
                text.to_string()
            }
        }
    }
}

/// When a consultation opened now expires; `None` when the timeout is out of range
fn consult_deadline(secs: u64) -> Option<DateTime<Utc>> {
    let deadline = i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|timeout| Utc::now().checked_add_signed(timeout));
    if deadline.is_none() {
        warn!(secs, "Consultation timeout out of range, the consultation will not expire");
    }
    deadline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockReply};
    use crate::workflow::parse_workflow;
    use tempfile::TempDir;

    fn options(temp: &TempDir) -> EngineOptions {
        EngineOptions {
            workdir: temp.path().to_path_buf(),
            checkpoint_dir: temp.path().join("checkpoints"),
            max_tokens: DEFAULT_MAX_TOKENS,
            loop_detection: LoopDetectorConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    fn engine(source: &str, backend: &Arc<MockBackend>, temp: &TempDir) -> ExecutionEngine {
        let workflow = parse_workflow(source).unwrap();
        ExecutionEngine::new(workflow, backend.clone(), options(temp)).unwrap()
    }

    fn long(text: &str) -> String {
        format!("{} {}", text, "padding ".repeat(20))
    }

    #[tokio::test]
    async fn test_prompts_sent_in_order() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::scripted(["first", "second"]));
        let mut engine = engine("PROMPT one\nPROMPT two\n", &backend, &temp);

        let outcome = engine.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(backend.sent(), vec!["one", "two"]);
        assert_eq!(engine.state().messages().len(), 4);
        assert_eq!(engine.state().status(), ExecutionStatus::Completed);
        assert_eq!(engine.state().last_response(), Some("second"));
        assert_eq!(backend.sessions_created(), 1);
        assert_eq!(backend.sessions_destroyed(), 1);
    }

    #[tokio::test]
    async fn test_cycles_render_runtime_vars() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("MAX-CYCLES 2\nPROMPT cycle {{cycle_number}} of {{max_cycles}}\n", &backend, &temp);

        engine.run().await.unwrap();

        assert_eq!(backend.sent(), vec!["cycle 1 of 2", "cycle 2 of 2"]);
        assert_eq!(engine.state().cycle_number, 2);
    }

    #[tokio::test]
    async fn test_prologue_and_epilogue_wrap_cycle() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("PROLOGUE start\nEPILOGUE end\nPROMPT a\nPROMPT b\n", &backend, &temp);

        engine.run().await.unwrap();

        assert_eq!(backend.sent(), vec!["start\n\na", "b\n\nend"]);
    }

    #[tokio::test]
    async fn test_elided_prompt_merges_into_next() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("PROMPT a\nELIDE\nPROMPT b\n", &backend, &temp);

        engine.run().await.unwrap();

        assert_eq!(backend.sent(), vec!["a\n\nb"]);
        assert_eq!(engine.state().prompt_index, 0);
    }

    #[tokio::test]
    async fn test_context_block_prefixes_first_prompt_only() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("notes.md"), "remember the milk").unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("CONTEXT notes.md\nPROMPT go\nPROMPT again\n", &backend, &temp);

        engine.run().await.unwrap();

        let sent = backend.sent();
        assert!(sent[0].contains("remember the milk"));
        assert!(sent[0].ends_with("go"));
        assert_eq!(sent[1], "again");
    }

    #[tokio::test]
    async fn test_missing_context_is_fatal_and_checkpointed() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("CONTEXT missing.md\nPROMPT go\n", &backend, &temp);

        let err = engine.run().await.unwrap_err();

        let checkpoint = err.checkpoint().unwrap().to_path_buf();
        assert!(matches!(err, EngineError::MissingContextFiles { .. }));
        assert!(checkpoint.exists());
        assert_eq!(engine.state().status(), ExecutionStatus::Failed);
        assert!(backend.sent().is_empty());
        let record = engine.store().require_pause().unwrap();
        assert_eq!(record.reason, PauseReason::MissingContext);
        assert_eq!(record.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_output_feeds_next_prompt() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("RUN echo hello\nPROMPT next\n", &backend, &temp);

        engine.run().await.unwrap();

        let sent = backend.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("$ echo hello"));
        assert!(sent[0].contains("hello\n"));
        assert!(sent[0].ends_with("next"));
    }

    #[tokio::test]
    async fn test_run_failure_retries_then_runs_on_failure_block() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let source = "RUN exit 1\nRUN-RETRY 1 \"please fix\"\nON-FAILURE\nPROMPT fix it\nEND\n";
        let mut engine = engine(source, &backend, &temp);

        let outcome = engine.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        let sent = backend.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with("please fix"));
        assert!(sent[0].contains("(exit code 1)"));
        assert!(sent[1].ends_with("fix it"));
        assert!(sent[1].contains("(exit code 1)"));
    }

    #[tokio::test]
    async fn test_on_success_block_runs_when_command_passes() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let source = "RUN-OUTPUT never\nRUN true\nON-SUCCESS\nPROMPT celebrate\nEND\nON-FAILURE\nPROMPT fix\nEND\n";
        let mut engine = engine(source, &backend, &temp);

        engine.run().await.unwrap();

        assert_eq!(backend.sent(), vec!["celebrate"]);
    }

    #[tokio::test]
    async fn test_failed_run_stops_by_default() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("RUN exit 3\nPROMPT never\n", &backend, &temp);

        let err = engine.run().await.unwrap_err();

        match &err {
            EngineError::StepFailed { step, message, .. } => {
                assert_eq!(step, "RUN exit 3");
                assert!(message.contains("code 3"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.checkpoint().unwrap().exists());
        assert!(backend.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_can_continue() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("RUN-ON-ERROR continue\nRUN-OUTPUT on-error\nRUN exit 3\nPROMPT next\n", &backend, &temp);

        engine.run().await.unwrap();

        assert!(backend.sent()[0].contains("(exit code 3)"));
    }

    #[tokio::test]
    async fn test_verify_step() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("out.txt"), "done").unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut first = engine("VERIFY paths out.txt\nPROMPT after\n", &backend, &temp);
        first.run().await.unwrap();
        assert_eq!(backend.sent(), vec!["after"]);

        let backend = Arc::new(MockBackend::new());
        let mut second = engine("VERIFY paths absent.txt\nPROMPT after\n", &backend, &temp);
        let err = second.run().await.unwrap_err();
        assert!(matches!(err, EngineError::StepFailed { .. }));
        assert!(err.to_string().contains("absent.txt"));
    }

    #[tokio::test]
    async fn test_unknown_verifier_is_fatal() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("VERIFY lint src\n", &backend, &temp);

        let err = engine.run().await.unwrap_err();
        assert!(err.to_string().contains("unknown verifier"));
    }

    #[tokio::test]
    async fn test_pause_step_writes_pause_record() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("PROMPT one\nPAUSE review the plan\nPROMPT two\n", &backend, &temp);

        let outcome = engine.run().await.unwrap();

        match outcome {
            RunOutcome::Paused {
                reason,
                message,
                checkpoint,
                ..
            } => {
                assert_eq!(reason, PauseReason::Gate);
                assert_eq!(message, "review the plan");
                assert!(checkpoint.ends_with("pause.json"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(backend.sent(), vec!["one"]);
        assert_eq!(engine.state().status(), ExecutionStatus::Paused);

        let record = engine.store().require_pause().unwrap();
        assert_eq!(record.step_index, Some(1));
        assert_eq!(record.prompt_index, 1);
        assert_eq!(record.messages.len(), 2);
        assert!(record.workflow_content.unwrap().contains("PAUSE review the plan"));
    }

    #[tokio::test]
    async fn test_rate_limit_pauses_with_retry_hint() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::scripted([MockReply::RateLimited(Some(Duration::from_secs(30)))]));
        let mut engine = engine("PROMPT one\n", &backend, &temp);

        let outcome = engine.run().await.unwrap();

        match outcome {
            RunOutcome::Paused {
                reason, retry_after, ..
            } => {
                assert_eq!(reason, PauseReason::RateLimited);
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(engine.state().messages().is_empty());
    }

    #[tokio::test]
    async fn test_backend_abort_is_fatal() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::scripted([MockReply::Abort("quota exhausted".to_string())]));
        let mut engine = engine("PROMPT one\n", &backend, &temp);

        let err = engine.run().await.unwrap_err();

        assert!(matches!(err, EngineError::BackendAborted { ref message, .. } if message == "quota exhausted"));
        assert_eq!(
            engine.store().require_pause().unwrap().reason,
            PauseReason::BackendAborted
        );
    }

    #[tokio::test]
    async fn test_identical_responses_detected_as_loop() {
        let temp = TempDir::new().unwrap();
        let reply = long("same answer");
        let backend = Arc::new(MockBackend::scripted([reply.clone(), reply.clone(), reply]));
        let workflow = parse_workflow("MAX-CYCLES 5\nPROMPT again\n").unwrap();
        let mut opts = options(&temp);
        opts.loop_detection.enabled = true;
        let mut engine = ExecutionEngine::new(workflow, backend.clone(), opts).unwrap();

        let err = engine.run().await.unwrap_err();

        match err {
            EngineError::LoopDetected { reason, checkpoint, .. } => {
                assert_eq!(reason, crate::detector::LoopReason::IdenticalResponses);
                assert!(checkpoint.exists());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_checkpoint_steps_and_each_cycle_policy() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("MAX-CYCLES 2\nCHECKPOINT-AFTER each-cycle\nPROMPT a\nCHECKPOINT manual\n", &backend, &temp);

        engine.run().await.unwrap();

        let names: Vec<String> = engine.state().checkpoints.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["manual", "checkpoint-2", "manual"]);
        assert_eq!(engine.store().list_checkpoints().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unwritable_policy_checkpoint_fails_with_pause_record() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let source = format!("CHECKPOINT-AFTER each-prompt\nCHECKPOINT-NAME {}\nPROMPT a\n", "x".repeat(300));
        let mut engine = engine(&source, &backend, &temp);

        let err = engine.run().await.unwrap_err();

        match &err {
            EngineError::StepFailed { step, checkpoint, .. } => {
                assert_eq!(step, "CHECKPOINT");
                assert!(checkpoint.ends_with("pause.json"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(backend.sent().is_empty());
        assert_eq!(engine.state().status(), ExecutionStatus::Failed);
        let record = engine.store().require_pause().unwrap();
        assert_eq!(record.reason, PauseReason::StepFailed);
        assert_eq!(record.step_index, Some(0));
    }

    #[tokio::test]
    async fn test_consult_timeout_out_of_range_never_expires() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut workflow = parse_workflow("PROMPT a\nCONSULT db\n").unwrap();
        workflow.consult_timeout_secs = Some(u64::MAX);
        let mut engine = ExecutionEngine::new(workflow, backend.clone(), options(&temp)).unwrap();

        let outcome = engine.run().await.unwrap();

        assert!(matches!(outcome, RunOutcome::Paused { reason: PauseReason::Consult, .. }));
        assert_eq!(engine.store().require_pause().unwrap().expires_at, None);
        assert!(consult_deadline(i64::MAX as u64).is_none());
        assert!(consult_deadline(3600).unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_compact_mode_compacts_after_first_cycle() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("MODE compact\nMAX-CYCLES 3\nPROMPT a\n", &backend, &temp);

        engine.run().await.unwrap();

        assert_eq!(backend.compactions(), 2);
        let summaries = engine
            .state()
            .messages()
            .iter()
            .filter(|m| m.role == crate::engine::Role::System)
            .count();
        assert_eq!(summaries, 2);
    }

    #[tokio::test]
    async fn test_fresh_mode_recreates_session_each_cycle() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("notes.md"), "ctx").unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("MODE fresh\nMAX-CYCLES 2\nCONTEXT notes.md\nPROMPT a\n", &backend, &temp);

        engine.run().await.unwrap();

        assert_eq!(backend.sessions_created(), 2);
        assert_eq!(backend.sessions_destroyed(), 2);
        let sent = backend.sent();
        assert!(sent[0].contains("ctx"));
        assert!(sent[1].contains("ctx"));
    }

    #[tokio::test]
    async fn test_context_limit_stop_sends_wrap_up_and_pauses() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new().with_usage(900, 1000));
        let source = "MAX-CYCLES 2\nON-CONTEXT-LIMIT stop\nON-CONTEXT-LIMIT-PROMPT wrap up\nPROMPT a\n";
        let mut engine = engine(source, &backend, &temp);

        let outcome = engine.run().await.unwrap();

        assert!(matches!(
            outcome,
            RunOutcome::Paused {
                reason: PauseReason::ContextLimit,
                ..
            }
        ));
        assert_eq!(backend.sent(), vec!["a", "wrap up"]);
        assert_eq!(backend.compactions(), 0);
    }

    #[tokio::test]
    async fn test_context_limit_compacts_by_default() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new().with_usage(900, 1000));
        let mut engine = engine("MAX-CYCLES 2\nPROMPT a\n", &backend, &temp);

        assert_eq!(engine.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(backend.compactions(), 1);
    }

    #[tokio::test]
    async fn test_new_conversation_replaces_session() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("PROMPT a\nNEW-CONVERSATION\nPROMPT b\n", &backend, &temp);

        engine.run().await.unwrap();

        assert_eq!(backend.sessions_created(), 2);
        assert_eq!(backend.sessions_destroyed(), 2);
    }

    #[tokio::test]
    async fn test_output_file_written_on_completion() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::scripted(["the answer"]));
        let source = "HEADER # Report\nFOOTER -- end\nOUTPUT-FILE out/report.md\nPROMPT a\n";
        let mut engine = engine(source, &backend, &temp);

        engine.run().await.unwrap();

        let written = std::fs::read_to_string(temp.path().join("out/report.md")).unwrap();
        assert_eq!(written, "# Report\n\nthe answer\n\n-- end\n");
    }

    #[tokio::test]
    async fn test_stop_flag_pauses_before_next_step() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("PROMPT a\n", &backend, &temp);
        engine.stop_flag().store(true, Ordering::SeqCst);

        let outcome = engine.run().await.unwrap();

        assert!(matches!(
            outcome,
            RunOutcome::Paused {
                reason: PauseReason::Stopped,
                ..
            }
        ));
        assert!(backend.sent().is_empty());
    }

    #[tokio::test]
    async fn test_streamed_events_forwarded() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::scripted([MockReply::WithReasoning {
            reasoning: "thinking".to_string(),
            text: "done".to_string(),
        }]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = engine("PROMPT a\n", &backend, &temp).with_events(tx);

        engine.run().await.unwrap();

        assert_eq!(rx.recv().await, Some(StreamEvent::Reasoning("thinking".to_string())));
        assert_eq!(rx.recv().await, Some(StreamEvent::Chunk("done".to_string())));
    }

    #[tokio::test]
    async fn test_run_twice_is_invalid_transition() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::new());
        let mut engine = engine("PROMPT a\n", &backend, &temp);

        engine.run().await.unwrap();
        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }
}
