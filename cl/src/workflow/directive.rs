//! Directive parser
//!
//! Turns workflow source text into an ordered list of typed directives.
//! A directive line looks like `UPPERCASE-NAME value`. Names outside the
//! known vocabulary are skipped so newer workflows still load on older
//! binaries. Paragraph directives (`PROMPT`, `ON-CONTEXT-LIMIT-PROMPT`,
//! `COMPACT-SUMMARY`) continue onto following indented lines; a blank or
//! non-indented line ends the paragraph.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

static DIRECTIVE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z][A-Z0-9]*(?:-[A-Z0-9]+)*)(?:\s+(.*))?$").expect("directive regex is valid")
});

/// Closed vocabulary of directive names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    // Metadata
    Model,
    Adapter,
    Mode,
    MaxCycles,
    Cwd,

    // Context
    Context,
    ContextOptional,
    ContextExclude,
    ContextLimit,
    OnContextLimit,
    OnContextLimitPrompt,

    // File rules
    AllowFiles,
    DenyFiles,
    AllowDir,
    DenyDir,

    // Prompt injection
    Prologue,
    Epilogue,
    Header,
    Footer,

    Refcat,

    // Steps
    Prompt,
    Elide,
    NewConversation,
    Compact,
    CompactPreserve,
    CompactSummary,
    CompactionMin,
    Checkpoint,
    CheckpointAfter,
    CheckpointName,
    Run,
    RunOnError,
    RunOutput,
    RunTimeout,
    RunCwd,
    RunEnv,
    RunRetry,
    Verify,
    VerifyOnError,
    VerifyOutput,
    Pause,
    Consult,
    ConsultTimeout,

    // Structure
    Include,
    OnFailure,
    OnSuccess,
    End,

    OutputFile,
}

impl DirectiveKind {
    /// Look up a directive by its source name
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "MODEL" => Self::Model,
            "ADAPTER" => Self::Adapter,
            "MODE" => Self::Mode,
            "MAX-CYCLES" => Self::MaxCycles,
            "CWD" => Self::Cwd,
            "CONTEXT" => Self::Context,
            "CONTEXT-OPTIONAL" => Self::ContextOptional,
            "CONTEXT-EXCLUDE" => Self::ContextExclude,
            "CONTEXT-LIMIT" => Self::ContextLimit,
            "ON-CONTEXT-LIMIT" => Self::OnContextLimit,
            "ON-CONTEXT-LIMIT-PROMPT" => Self::OnContextLimitPrompt,
            "ALLOW-FILES" => Self::AllowFiles,
            "DENY-FILES" => Self::DenyFiles,
            "ALLOW-DIR" => Self::AllowDir,
            "DENY-DIR" => Self::DenyDir,
            "PROLOGUE" => Self::Prologue,
            "EPILOGUE" => Self::Epilogue,
            "HEADER" => Self::Header,
            "FOOTER" => Self::Footer,
            "REFCAT" => Self::Refcat,
            "PROMPT" => Self::Prompt,
            "ELIDE" => Self::Elide,
            "NEW-CONVERSATION" => Self::NewConversation,
            "COMPACT" => Self::Compact,
            "COMPACT-PRESERVE" => Self::CompactPreserve,
            "COMPACT-SUMMARY" => Self::CompactSummary,
            "COMPACTION-MIN" => Self::CompactionMin,
            "CHECKPOINT" => Self::Checkpoint,
            "CHECKPOINT-AFTER" => Self::CheckpointAfter,
            "CHECKPOINT-NAME" => Self::CheckpointName,
            "RUN" => Self::Run,
            "RUN-ON-ERROR" => Self::RunOnError,
            "RUN-OUTPUT" => Self::RunOutput,
            "RUN-TIMEOUT" => Self::RunTimeout,
            "RUN-CWD" => Self::RunCwd,
            "RUN-ENV" => Self::RunEnv,
            "RUN-RETRY" => Self::RunRetry,
            "VERIFY" => Self::Verify,
            "VERIFY-ON-ERROR" => Self::VerifyOnError,
            "VERIFY-OUTPUT" => Self::VerifyOutput,
            "PAUSE" => Self::Pause,
            "CONSULT" => Self::Consult,
            "CONSULT-TIMEOUT" => Self::ConsultTimeout,
            "INCLUDE" => Self::Include,
            "ON-FAILURE" => Self::OnFailure,
            "ON-SUCCESS" => Self::OnSuccess,
            "END" => Self::End,
            "OUTPUT-FILE" => Self::OutputFile,
            _ => return None,
        };
        Some(kind)
    }

    /// Source name of this directive
    pub fn name(&self) -> &'static str {
        match self {
            Self::Model => "MODEL",
            Self::Adapter => "ADAPTER",
            Self::Mode => "MODE",
            Self::MaxCycles => "MAX-CYCLES",
            Self::Cwd => "CWD",
            Self::Context => "CONTEXT",
            Self::ContextOptional => "CONTEXT-OPTIONAL",
            Self::ContextExclude => "CONTEXT-EXCLUDE",
            Self::ContextLimit => "CONTEXT-LIMIT",
            Self::OnContextLimit => "ON-CONTEXT-LIMIT",
            Self::OnContextLimitPrompt => "ON-CONTEXT-LIMIT-PROMPT",
            Self::AllowFiles => "ALLOW-FILES",
            Self::DenyFiles => "DENY-FILES",
            Self::AllowDir => "ALLOW-DIR",
            Self::DenyDir => "DENY-DIR",
            Self::Prologue => "PROLOGUE",
            Self::Epilogue => "EPILOGUE",
            Self::Header => "HEADER",
            Self::Footer => "FOOTER",
            Self::Refcat => "REFCAT",
            Self::Prompt => "PROMPT",
            Self::Elide => "ELIDE",
            Self::NewConversation => "NEW-CONVERSATION",
            Self::Compact => "COMPACT",
            Self::CompactPreserve => "COMPACT-PRESERVE",
            Self::CompactSummary => "COMPACT-SUMMARY",
            Self::CompactionMin => "COMPACTION-MIN",
            Self::Checkpoint => "CHECKPOINT",
            Self::CheckpointAfter => "CHECKPOINT-AFTER",
            Self::CheckpointName => "CHECKPOINT-NAME",
            Self::Run => "RUN",
            Self::RunOnError => "RUN-ON-ERROR",
            Self::RunOutput => "RUN-OUTPUT",
            Self::RunTimeout => "RUN-TIMEOUT",
            Self::RunCwd => "RUN-CWD",
            Self::RunEnv => "RUN-ENV",
            Self::RunRetry => "RUN-RETRY",
            Self::Verify => "VERIFY",
            Self::VerifyOnError => "VERIFY-ON-ERROR",
            Self::VerifyOutput => "VERIFY-OUTPUT",
            Self::Pause => "PAUSE",
            Self::Consult => "CONSULT",
            Self::ConsultTimeout => "CONSULT-TIMEOUT",
            Self::Include => "INCLUDE",
            Self::OnFailure => "ON-FAILURE",
            Self::OnSuccess => "ON-SUCCESS",
            Self::End => "END",
            Self::OutputFile => "OUTPUT-FILE",
        }
    }

    /// Paragraph directives absorb following indented lines
    pub fn is_paragraph(&self) -> bool {
        matches!(self, Self::Prompt | Self::OnContextLimitPrompt | Self::CompactSummary)
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One parsed directive line (plus any continuation lines)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub value: String,
    /// 1-based line the directive started on
    pub line: usize,
}

impl Directive {
    pub fn new(kind: DirectiveKind, value: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            value: value.into(),
            line,
        }
    }
}

/// Paragraph directive still collecting continuation lines
struct OpenParagraph {
    kind: DirectiveKind,
    line: usize,
    lines: Vec<String>,
}

impl OpenParagraph {
    fn finish(self) -> Directive {
        Directive::new(self.kind, self.lines.join("\n"), self.line)
    }
}

/// Parse workflow source into ordered directives
pub fn parse(text: &str) -> Vec<Directive> {
    debug!(text_len = text.len(), "parse: called");
    let mut directives = Vec::new();
    let mut open: Option<OpenParagraph> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let indented = raw.starts_with(|c: char| c.is_whitespace());
        let trimmed = raw.trim();

        if let Some(paragraph) = open.as_mut() {
            if indented && !trimmed.is_empty() {
                paragraph.lines.push(trimmed.to_string());
                continue;
            }
            if let Some(paragraph) = open.take() {
                directives.push(paragraph.finish());
            }
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if indented {
            debug!(line = line_no, "parse: skipping stray indented line");
            continue;
        }

        let Some(caps) = DIRECTIVE_LINE.captures(trimmed) else {
            debug!(line = line_no, "parse: not a directive line");
            continue;
        };
        let name = &caps[1];
        let Some(kind) = DirectiveKind::from_name(name) else {
            debug!(line = line_no, %name, "parse: unknown directive skipped");
            continue;
        };
        let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();

        if kind.is_paragraph() {
            let mut lines = Vec::new();
            if !value.is_empty() {
                lines.push(value.to_string());
            }
            open = Some(OpenParagraph {
                kind,
                line: line_no,
                lines,
            });
        } else {
            directives.push(Directive::new(kind, value, line_no));
        }
    }

    if let Some(paragraph) = open.take() {
        directives.push(paragraph.finish());
    }

    debug!(count = directives.len(), "parse: complete");
    directives
}
