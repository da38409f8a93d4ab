//! WorkflowDefinition - the parsed, structured workflow program
//!
//! A definition is built once at load time. The flat prompt list is never
//! stored: it is derived from `steps` on demand. CLI overrides produce a new
//! definition through [`WorkflowDefinition::with_overrides`] rather than
//! mutating a shared instance.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use super::step::Step;
use crate::context::SessionMode;

/// Default context threshold (fraction of the window) before compaction
pub const DEFAULT_CONTEXT_LIMIT: f64 = 0.8;

/// Default RUN timeout in seconds
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 60;

/// What to do when the context window crosses its limit in accumulate mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextLimitAction {
    #[default]
    Compact,
    Stop,
}

/// When checkpoints are written automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointPolicy {
    EachCycle,
    EachPrompt,
    #[default]
    Never,
}

/// Reaction to a failing RUN without an ON-FAILURE block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunOnError {
    #[default]
    Stop,
    Continue,
}

/// Reaction to a failing VERIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyOnError {
    #[default]
    Fail,
    Continue,
}

/// Whether command/verifier output is forwarded to the next prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputPolicy {
    #[default]
    Always,
    OnError,
    Never,
}

impl OutputPolicy {
    /// Should output be forwarded given the outcome
    pub fn includes(&self, failed: bool) -> bool {
        match self {
            OutputPolicy::Always => true,
            OutputPolicy::OnError => failed,
            OutputPolicy::Never => false,
        }
    }
}

macro_rules! keyword_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown value '{}', expected one of: {}",
                        other,
                        [$($text),+].join(", ")
                    )),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $(Self::$variant => $text,)+
                };
                f.write_str(text)
            }
        }
    };
}

keyword_enum!(ContextLimitAction { Compact => "compact", Stop => "stop" });
keyword_enum!(CheckpointPolicy { EachCycle => "each-cycle", EachPrompt => "each-prompt", Never => "never" });
keyword_enum!(RunOnError { Stop => "stop", Continue => "continue" });
keyword_enum!(VerifyOnError { Fail => "fail", Continue => "continue" });
keyword_enum!(OutputPolicy { Always => "always", OnError => "on-error", Never => "never" });

/// Context file patterns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextPatterns {
    /// Must resolve to at least one file
    pub required: Vec<String>,
    /// Missing matches only warn
    pub optional: Vec<String>,
    /// Files matching these are never loaded
    pub excluded: Vec<String>,
}

impl ContextPatterns {
    /// Append another set of patterns (INCLUDE splicing)
    pub fn extend(&mut self, other: &ContextPatterns) {
        self.required.extend(other.required.iter().cloned());
        self.optional.extend(other.optional.iter().cloned());
        self.excluded.extend(other.excluded.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

/// File access allow/deny glob rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRules {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl FileRules {
    /// Merge command-line rules into workflow rules
    ///
    /// CLI allow patterns replace the workflow's allow list; CLI deny
    /// patterns are added to the workflow's deny list.
    pub fn merged_with_cli(&self, cli_allow: &[String], cli_deny: &[String]) -> FileRules {
        debug!(cli_allow = cli_allow.len(), cli_deny = cli_deny.len(), "FileRules::merged_with_cli: called");
        let allow = if cli_allow.is_empty() {
            self.allow.clone()
        } else {
            cli_allow.to_vec()
        };
        let mut deny = self.deny.clone();
        deny.extend(cli_deny.iter().cloned());
        FileRules { allow, deny }
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// Text injected around prompts and output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptInjection {
    /// Prepended to the first prompt of each cycle
    pub prologues: Vec<String>,
    /// Appended to the last prompt of each cycle
    pub epilogues: Vec<String>,
    /// Written before the output file body
    pub headers: Vec<String>,
    /// Written after the output file body
    pub footers: Vec<String>,
}

impl PromptInjection {
    pub fn extend(&mut self, other: &PromptInjection) {
        self.prologues.extend(other.prologues.iter().cloned());
        self.epilogues.extend(other.epilogues.iter().cloned());
        self.headers.extend(other.headers.iter().cloned());
        self.footers.extend(other.footers.iter().cloned());
    }
}

/// Compaction policy settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionSettings {
    /// Minimum usage (ratio) before automatic compaction is considered
    pub min_density: Option<f64>,
    /// Custom summary instruction
    pub summary: Option<String>,
}

/// Checkpoint policy settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointSettings {
    pub after: CheckpointPolicy,
    /// Name used for checkpoints without an explicit name
    pub name: Option<String>,
}

/// Defaults applied to every RUN step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub on_error: RunOnError,
    pub output: OutputPolicy,
    pub timeout_secs: u64,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            on_error: RunOnError::default(),
            output: OutputPolicy::default(),
            timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

/// Defaults applied to every VERIFY step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifySettings {
    pub on_error: VerifyOnError,
    pub output: OutputPolicy,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            on_error: VerifyOnError::default(),
            output: OutputPolicy::OnError,
        }
    }
}

/// Where a definition came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Loaded from a workflow file
    File(PathBuf),
    /// Built from inline text (ad hoc prompt or in-memory source)
    Inline(String),
}

impl Default for Provenance {
    fn default() -> Self {
        Provenance::Inline(String::new())
    }
}

/// Explicit overrides applied on top of a parsed definition
#[derive(Debug, Clone, Default)]
pub struct WorkflowOverrides {
    pub model: Option<String>,
    pub adapter: Option<String>,
    pub max_cycles: Option<u32>,
    pub mode: Option<SessionMode>,
    pub allow_files: Vec<String>,
    pub deny_files: Vec<String>,
}

/// The parsed workflow program plus its policy settings
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub model: Option<String>,
    pub adapter: Option<String>,
    pub mode: SessionMode,
    pub max_cycles: u32,
    pub cwd: Option<PathBuf>,

    pub context: ContextPatterns,
    /// Fraction of the window at which the context counts as near its limit
    pub context_limit: f64,
    pub on_context_limit: ContextLimitAction,
    pub on_context_limit_prompt: Option<String>,

    pub file_rules: FileRules,
    pub injection: PromptInjection,
    /// Reference catalog entries
    pub refcat: Vec<String>,

    pub compaction: CompactionSettings,
    pub checkpoints: CheckpointSettings,
    pub run: RunSettings,
    pub verify: VerifySettings,
    pub consult_timeout_secs: Option<u64>,
    pub output_file: Option<PathBuf>,

    pub steps: Vec<Step>,
    pub source: Provenance,
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self {
            model: None,
            adapter: None,
            mode: SessionMode::default(),
            max_cycles: 1,
            cwd: None,
            context: ContextPatterns::default(),
            context_limit: DEFAULT_CONTEXT_LIMIT,
            on_context_limit: ContextLimitAction::default(),
            on_context_limit_prompt: None,
            file_rules: FileRules::default(),
            injection: PromptInjection::default(),
            refcat: Vec::new(),
            compaction: CompactionSettings::default(),
            checkpoints: CheckpointSettings::default(),
            run: RunSettings::default(),
            verify: VerifySettings::default(),
            consult_timeout_secs: None,
            output_file: None,
            steps: Vec::new(),
            source: Provenance::default(),
        }
    }
}

impl WorkflowDefinition {
    /// Build a single-prompt workflow from ad hoc text
    pub fn from_prompts<I, S>(prompts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps: Vec<Step> = prompts.into_iter().map(Step::prompt).collect();
        debug!(prompt_count = steps.len(), "WorkflowDefinition::from_prompts: called");
        let inline = steps.iter().map(|s| s.content().to_string()).collect::<Vec<_>>().join("\n");
        Self {
            steps,
            source: Provenance::Inline(inline),
            ..Default::default()
        }
    }

    /// Flat prompt list, derived from the step program
    pub fn prompts(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::Prompt { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn prompt_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_prompt()).count()
    }

    /// PAUSE/CONSULT anchors as `(prompt_index, message)`
    ///
    /// The anchor is the index of the most recent prompt before the gate,
    /// or `None` when the gate precedes the first prompt.
    pub fn pause_points(&self) -> Vec<(Option<usize>, String)> {
        let mut points = Vec::new();
        let mut prompts_seen = 0usize;
        for step in &self.steps {
            match step {
                Step::Prompt { .. } => prompts_seen += 1,
                Step::Pause { message } => points.push((prompts_seen.checked_sub(1), message.clone())),
                Step::Consult { topic } => points.push((prompts_seen.checked_sub(1), topic.clone())),
                _ => {}
            }
        }
        points
    }

    /// Preserve items gathered from every COMPACT step, in order, deduplicated
    pub fn compaction_preserve(&self) -> Vec<String> {
        let mut items: Vec<String> = Vec::new();
        for step in &self.steps {
            if let Step::Compact { preserve } = step {
                for item in preserve {
                    if !items.contains(item) {
                        items.push(item.clone());
                    }
                }
            }
        }
        items
    }

    /// Step position to resume from after `prompt_index` prompts were sent
    pub fn resume_step(&self, prompt_index: usize) -> usize {
        if prompt_index == 0 {
            return 0;
        }
        let mut seen = 0usize;
        for (idx, step) in self.steps.iter().enumerate() {
            if step.is_prompt() {
                seen += 1;
                if seen == prompt_index {
                    return idx + 1;
                }
            }
        }
        self.steps.len()
    }

    /// Workflow source file, if any
    pub fn source_path(&self) -> Option<&Path> {
        match &self.source {
            Provenance::File(path) => Some(path),
            Provenance::Inline(_) => None,
        }
    }

    /// Directory relative paths in the workflow resolve against
    pub fn base_dir(&self) -> PathBuf {
        self.source_path()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Short display name (file stem or "inline")
    pub fn name(&self) -> String {
        self.source_path()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "inline".to_string())
    }

    /// Copy of this definition with explicit overrides applied
    pub fn with_overrides(&self, overrides: &WorkflowOverrides) -> WorkflowDefinition {
        debug!(?overrides, "WorkflowDefinition::with_overrides: called");
        let mut def = self.clone();
        if let Some(model) = &overrides.model {
            def.model = Some(model.clone());
        }
        if let Some(adapter) = &overrides.adapter {
            def.adapter = Some(adapter.clone());
        }
        if let Some(max_cycles) = overrides.max_cycles {
            def.max_cycles = max_cycles;
        }
        if let Some(mode) = overrides.mode {
            def.mode = mode;
        }
        def.file_rules = self
            .file_rules
            .merged_with_cli(&overrides.allow_files, &overrides.deny_files);
        def
    }
}
