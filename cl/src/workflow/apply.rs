//! Directive applicator
//!
//! Every directive kind maps to one [`Action`] in [`action_for`]. Plain
//! settings are pure `(definition, value) -> definition` functions; step
//! directives build a [`Step`] that lands either in the top-level program or
//! in the currently open ON-FAILURE/ON-SUCCESS block; a few directives amend
//! the most recent step of a given kind. INCLUDE and the block directives are
//! structural and handled by [`Applicator`] itself.

use std::mem;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::definition::WorkflowDefinition;
use super::directive::{Directive, DirectiveKind};
use super::error::ParseError;
use super::loader::{IncludeGuard, load_included};
use super::step::{RunStep, Step};

/// Pure settings mutation
pub type FieldFn = fn(WorkflowDefinition, &str) -> Result<WorkflowDefinition, String>;

/// Builds a new step from the directive value
pub type StepFn = fn(&str) -> Result<Step, String>;

/// Retroactively modifies the step list being built
pub type AmendFn = fn(&mut Vec<Step>, &str) -> Result<(), String>;

/// How a directive kind is applied
#[derive(Clone, Copy)]
pub enum Action {
    Field(FieldFn),
    Step(StepFn),
    Amend(AmendFn),
    Structural,
}

/// Dispatch table: directive kind to its action
pub fn action_for(kind: DirectiveKind) -> Action {
    use DirectiveKind as K;
    match kind {
        K::Model => Action::Field(fields::model),
        K::Adapter => Action::Field(fields::adapter),
        K::Mode => Action::Field(fields::mode),
        K::MaxCycles => Action::Field(fields::max_cycles),
        K::Cwd => Action::Field(fields::cwd),
        K::Context => Action::Field(fields::context),
        K::ContextOptional => Action::Field(fields::context_optional),
        K::ContextExclude => Action::Field(fields::context_exclude),
        K::ContextLimit => Action::Field(fields::context_limit),
        K::OnContextLimit => Action::Field(fields::on_context_limit),
        K::OnContextLimitPrompt => Action::Field(fields::on_context_limit_prompt),
        K::AllowFiles => Action::Field(fields::allow_files),
        K::DenyFiles => Action::Field(fields::deny_files),
        K::AllowDir => Action::Field(fields::allow_dir),
        K::DenyDir => Action::Field(fields::deny_dir),
        K::Prologue => Action::Field(fields::prologue),
        K::Epilogue => Action::Field(fields::epilogue),
        K::Header => Action::Field(fields::header),
        K::Footer => Action::Field(fields::footer),
        K::Refcat => Action::Field(fields::refcat),
        K::CompactSummary => Action::Field(fields::compact_summary),
        K::CompactionMin => Action::Field(fields::compaction_min),
        K::CheckpointAfter => Action::Field(fields::checkpoint_after),
        K::CheckpointName => Action::Field(fields::checkpoint_name),
        K::RunOnError => Action::Field(fields::run_on_error),
        K::RunOutput => Action::Field(fields::run_output),
        K::RunTimeout => Action::Field(fields::run_timeout),
        K::RunCwd => Action::Field(fields::run_cwd),
        K::RunEnv => Action::Field(fields::run_env),
        K::VerifyOnError => Action::Field(fields::verify_on_error),
        K::VerifyOutput => Action::Field(fields::verify_output),
        K::ConsultTimeout => Action::Field(fields::consult_timeout),
        K::OutputFile => Action::Field(fields::output_file),

        K::Prompt => Action::Step(steps::prompt),
        K::Elide => Action::Step(steps::elide),
        K::NewConversation => Action::Step(steps::new_conversation),
        K::Compact => Action::Step(steps::compact),
        K::Checkpoint => Action::Step(steps::checkpoint),
        K::Run => Action::Step(steps::run),
        K::Verify => Action::Step(steps::verify),
        K::Pause => Action::Step(steps::pause),
        K::Consult => Action::Step(steps::consult),

        K::RunRetry => Action::Amend(amend::run_retry),
        K::CompactPreserve => Action::Amend(amend::compact_preserve),

        K::Include | K::OnFailure | K::OnSuccess | K::End => Action::Structural,
    }
}

/// Longest accepted CONSULT-TIMEOUT
pub const MAX_CONSULT_TIMEOUT_SECS: u64 = 365 * 86_400;

/// Convert `80`, `80%` or `0.8` into a 0-1 ratio
pub fn parse_percentage(value: &str) -> Result<f64, String> {
    let trimmed = value.trim();
    let number = trimmed.trim_end_matches('%').trim();
    let parsed: f64 = number
        .parse()
        .map_err(|_| format!("'{}' is not a percentage", trimmed))?;
    if !(0.0..=100.0).contains(&parsed) {
        return Err(format!("'{}' is out of range (0-100)", trimmed));
    }
    if trimmed.ends_with('%') || parsed > 1.0 {
        Ok(parsed / 100.0)
    } else {
        Ok(parsed)
    }
}

/// Convert `30`, `30s`, `2m` or `1h` into whole seconds
pub fn parse_duration(value: &str) -> Result<u64, String> {
    let trimmed = value.trim().to_lowercase();
    let (number, multiplier) = if let Some(n) = trimmed.strip_suffix('h') {
        (n, 3600)
    } else if let Some(n) = trimmed.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = trimmed.strip_suffix('s') {
        (n, 1)
    } else {
        (trimmed.as_str(), 1)
    };
    let parsed: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a duration (use 30, 30s, 2m or 1h)", value.trim()))?;
    parsed
        .checked_mul(multiplier)
        .ok_or_else(|| format!("'{}' is too long a duration", value.trim()))
}

fn non_empty(value: &str, what: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(format!("{} requires a value", what))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Paragraph value; one JSON string literal spanning the whole value is decoded
fn paragraph_value(value: &str, what: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.len() >= 2
        && trimmed.starts_with('"')
        && trimmed.ends_with('"')
        && let Ok(decoded) = serde_json::from_str::<String>(trimmed)
    {
        if decoded.is_empty() {
            return Err(format!("{} requires a value", what));
        }
        return Ok(decoded);
    }
    non_empty(value, what)
}

/// Split a list on `sep` (whitespace when `None`); items may be JSON-quoted
fn split_items(value: &str, sep: Option<char>) -> Result<Vec<String>, String> {
    let is_sep = move |c: char| match sep {
        Some(sep) => c == sep,
        None => c.is_whitespace(),
    };
    let mut items = Vec::new();
    let mut rest = value.trim_start();
    while !rest.is_empty() {
        if rest.starts_with('"') {
            let end = closing_quote(rest).ok_or_else(|| format!("unterminated quoted item in '{}'", value.trim()))?;
            let quoted = &rest[..=end];
            let item: String =
                serde_json::from_str(quoted).map_err(|e| format!("invalid quoted item {}: {}", quoted, e))?;
            items.push(item);
            rest = &rest[end + 1..];
            if let Some(c) = rest.chars().next()
                && !is_sep(c)
                && !c.is_whitespace()
            {
                return Err(format!("missing separator after {}", quoted));
            }
            rest = rest.trim_start();
        } else {
            let end = rest.find(is_sep).unwrap_or(rest.len());
            let item = rest[..end].trim();
            if !item.is_empty() {
                items.push(item.to_string());
            }
            rest = &rest[end..];
        }
        if let Some(c) = rest.chars().next()
            && is_sep(c)
        {
            rest = rest[c.len_utf8()..].trim_start();
        }
    }
    Ok(items)
}

/// Byte offset of the quote closing the one `text` starts with
fn closing_quote(text: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, c) in text.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(idx),
            _ => {}
        }
    }
    None
}

mod fields {
    use super::*;

    pub fn model(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.model = Some(non_empty(value, "MODEL")?);
        Ok(def)
    }

    pub fn adapter(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.adapter = Some(non_empty(value, "ADAPTER")?);
        Ok(def)
    }

    pub fn mode(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.mode = value.parse()?;
        Ok(def)
    }

    pub fn max_cycles(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        let cycles: u32 = value
            .trim()
            .parse()
            .map_err(|_| format!("'{}' is not a cycle count", value.trim()))?;
        if cycles == 0 {
            return Err("MAX-CYCLES must be at least 1".to_string());
        }
        def.max_cycles = cycles;
        Ok(def)
    }

    pub fn cwd(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.cwd = Some(PathBuf::from(non_empty(value, "CWD")?));
        Ok(def)
    }

    pub fn context(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.context.required.push(non_empty(value, "CONTEXT")?);
        Ok(def)
    }

    pub fn context_optional(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.context.optional.push(non_empty(value, "CONTEXT-OPTIONAL")?);
        Ok(def)
    }

    pub fn context_exclude(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.context.excluded.push(non_empty(value, "CONTEXT-EXCLUDE")?);
        Ok(def)
    }

    pub fn context_limit(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.context_limit = parse_percentage(value)?;
        Ok(def)
    }

    pub fn on_context_limit(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.on_context_limit = value.parse()?;
        Ok(def)
    }

    pub fn on_context_limit_prompt(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.on_context_limit_prompt = Some(paragraph_value(value, "ON-CONTEXT-LIMIT-PROMPT")?);
        Ok(def)
    }

    pub fn allow_files(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.file_rules.allow.extend(split_items(value, None)?);
        Ok(def)
    }

    pub fn deny_files(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.file_rules.deny.extend(split_items(value, None)?);
        Ok(def)
    }

    pub fn allow_dir(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        let dir = non_empty(value, "ALLOW-DIR")?;
        def.file_rules.allow.push(format!("{}/**", dir.trim_end_matches('/')));
        Ok(def)
    }

    pub fn deny_dir(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        let dir = non_empty(value, "DENY-DIR")?;
        def.file_rules.deny.push(format!("{}/**", dir.trim_end_matches('/')));
        Ok(def)
    }

    pub fn prologue(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.injection.prologues.push(non_empty(value, "PROLOGUE")?);
        Ok(def)
    }

    pub fn epilogue(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.injection.epilogues.push(non_empty(value, "EPILOGUE")?);
        Ok(def)
    }

    pub fn header(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.injection.headers.push(non_empty(value, "HEADER")?);
        Ok(def)
    }

    pub fn footer(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.injection.footers.push(non_empty(value, "FOOTER")?);
        Ok(def)
    }

    pub fn refcat(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.refcat.push(non_empty(value, "REFCAT")?);
        Ok(def)
    }

    pub fn compact_summary(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.compaction.summary = Some(paragraph_value(value, "COMPACT-SUMMARY")?);
        Ok(def)
    }

    pub fn compaction_min(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.compaction.min_density = Some(parse_percentage(value)?);
        Ok(def)
    }

    pub fn checkpoint_after(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.checkpoints.after = value.parse()?;
        Ok(def)
    }

    pub fn checkpoint_name(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.checkpoints.name = Some(non_empty(value, "CHECKPOINT-NAME")?);
        Ok(def)
    }

    pub fn run_on_error(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.run.on_error = value.parse()?;
        Ok(def)
    }

    pub fn run_output(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.run.output = value.parse()?;
        Ok(def)
    }

    pub fn run_timeout(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.run.timeout_secs = parse_duration(value)?;
        Ok(def)
    }

    pub fn run_cwd(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.run.cwd = Some(PathBuf::from(non_empty(value, "RUN-CWD")?));
        Ok(def)
    }

    pub fn run_env(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        let (key, val) = value
            .trim()
            .split_once('=')
            .ok_or_else(|| format!("'{}' is not KEY=VALUE", value.trim()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err("RUN-ENV requires a variable name".to_string());
        }
        def.run.env.insert(key.to_string(), val.trim().to_string());
        Ok(def)
    }

    pub fn verify_on_error(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.verify.on_error = value.parse()?;
        Ok(def)
    }

    pub fn verify_output(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.verify.output = value.parse()?;
        Ok(def)
    }

    pub fn consult_timeout(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        let secs = parse_duration(value)?;
        if secs > MAX_CONSULT_TIMEOUT_SECS {
            return Err(format!(
                "'{}' exceeds the longest consultation window ({} days)",
                value.trim(),
                MAX_CONSULT_TIMEOUT_SECS / 86_400
            ));
        }
        def.consult_timeout_secs = Some(secs);
        Ok(def)
    }

    pub fn output_file(mut def: WorkflowDefinition, value: &str) -> Result<WorkflowDefinition, String> {
        def.output_file = Some(PathBuf::from(non_empty(value, "OUTPUT-FILE")?));
        Ok(def)
    }
}

mod steps {
    use super::*;

    pub fn prompt(value: &str) -> Result<Step, String> {
        Ok(Step::prompt(paragraph_value(value, "PROMPT")?))
    }

    pub fn elide(_value: &str) -> Result<Step, String> {
        Ok(Step::Elide)
    }

    pub fn new_conversation(_value: &str) -> Result<Step, String> {
        Ok(Step::NewConversation)
    }

    pub fn compact(value: &str) -> Result<Step, String> {
        Ok(Step::Compact {
            preserve: split_items(value, Some(','))?,
        })
    }

    pub fn checkpoint(value: &str) -> Result<Step, String> {
        let name = value.trim();
        Ok(Step::Checkpoint {
            name: (!name.is_empty()).then(|| name.to_string()),
        })
    }

    pub fn run(value: &str) -> Result<Step, String> {
        Ok(Step::run(non_empty(value, "RUN")?))
    }

    pub fn verify(value: &str) -> Result<Step, String> {
        let value = non_empty(value, "VERIFY")?;
        let (verifier, args) = match value.split_once(char::is_whitespace) {
            Some((verifier, args)) => (verifier.to_string(), args.trim().to_string()),
            None => (value, String::new()),
        };
        Ok(Step::Verify { verifier, args })
    }

    pub fn pause(value: &str) -> Result<Step, String> {
        let message = value.trim();
        Ok(Step::Pause {
            message: if message.is_empty() {
                "Paused".to_string()
            } else {
                message.to_string()
            },
        })
    }

    pub fn consult(value: &str) -> Result<Step, String> {
        Ok(Step::Consult {
            topic: non_empty(value, "CONSULT")?,
        })
    }
}

mod amend {
    use super::*;

    /// `RUN-RETRY <count> ["prompt"]` onto the most recent RUN
    pub fn run_retry(steps: &mut Vec<Step>, value: &str) -> Result<(), String> {
        let value = value.trim();
        let (count, rest) = match value.split_once(char::is_whitespace) {
            Some((count, rest)) => (count, rest.trim()),
            None => (value, ""),
        };
        let retry_count: u32 = count
            .parse()
            .map_err(|_| format!("'{}' is not a retry count", count))?;
        let prompt = rest.trim_matches('"').trim();
        let retry_prompt = (!prompt.is_empty()).then(|| prompt.to_string());

        if let Some(run) = steps.iter_mut().rev().find_map(Step::as_run_mut) {
            run.retry_count = retry_count;
            run.retry_prompt = retry_prompt;
            return Ok(());
        }

        debug!("run_retry: no preceding RUN, creating standalone step");
        steps.push(Step::Run(RunStep {
            command: String::new(),
            retry_count,
            retry_prompt,
            ..Default::default()
        }));
        Ok(())
    }

    /// `COMPACT-PRESERVE a, b` onto the most recent COMPACT
    pub fn compact_preserve(steps: &mut Vec<Step>, value: &str) -> Result<(), String> {
        let items = split_items(value, Some(','))?;
        if items.is_empty() {
            return Err("COMPACT-PRESERVE requires at least one item".to_string());
        }
        let last_compact = steps.iter_mut().rev().find_map(|step| match step {
            Step::Compact { preserve } => Some(preserve),
            _ => None,
        });
        match last_compact {
            Some(preserve) => preserve.extend(items),
            None => {
                debug!("compact_preserve: no preceding COMPACT, creating standalone step");
                steps.push(Step::Compact { preserve: items });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    OnFailure,
    OnSuccess,
}

impl BlockKind {
    fn name(&self) -> &'static str {
        match self {
            BlockKind::OnFailure => "ON-FAILURE",
            BlockKind::OnSuccess => "ON-SUCCESS",
        }
    }
}

/// Control block collecting steps until END
struct OpenBlock {
    kind: BlockKind,
    line: usize,
    steps: Vec<Step>,
}

/// Applies directives, in order, to a definition under construction
pub struct Applicator<'g> {
    def: WorkflowDefinition,
    block: Option<OpenBlock>,
    base_dir: PathBuf,
    guard: &'g mut IncludeGuard,
}

impl<'g> Applicator<'g> {
    pub fn new(def: WorkflowDefinition, base_dir: impl AsRef<Path>, guard: &'g mut IncludeGuard) -> Self {
        Self {
            def,
            block: None,
            base_dir: base_dir.as_ref().to_path_buf(),
            guard,
        }
    }

    /// Apply every directive then close out the definition
    pub fn apply_all(mut self, directives: &[Directive]) -> Result<WorkflowDefinition, ParseError> {
        for directive in directives {
            self.apply(directive)?;
        }
        self.finish()
    }

    /// Apply one directive
    pub fn apply(&mut self, directive: &Directive) -> Result<(), ParseError> {
        debug!(kind = %directive.kind, line = directive.line, "Applicator::apply: called");
        let invalid = |reason: String| ParseError::InvalidValue {
            directive: directive.kind.name().to_string(),
            line: directive.line,
            reason,
        };

        match action_for(directive.kind) {
            Action::Field(apply) => {
                let def = mem::take(&mut self.def);
                self.def = apply(def, &directive.value).map_err(invalid)?;
            }
            Action::Step(build) => {
                let step = build(&directive.value).map_err(invalid)?;
                self.target().push(step);
            }
            Action::Amend(amend) => {
                amend(self.target(), &directive.value).map_err(invalid)?;
            }
            Action::Structural => match directive.kind {
                DirectiveKind::OnFailure => self.open_block(BlockKind::OnFailure, directive.line)?,
                DirectiveKind::OnSuccess => self.open_block(BlockKind::OnSuccess, directive.line)?,
                DirectiveKind::End => self.close_block(directive.line)?,
                DirectiveKind::Include => self.include(&directive.value, directive.line)?,
                other => {
                    return Err(invalid(format!("{} is not a structural directive", other)));
                }
            },
        }
        Ok(())
    }

    /// Reject unclosed blocks and hand back the definition
    pub fn finish(self) -> Result<WorkflowDefinition, ParseError> {
        if let Some(block) = self.block {
            return Err(ParseError::UnclosedBlock {
                kind: block.kind.name().to_string(),
                line: block.line,
            });
        }
        Ok(self.def)
    }

    /// Step list new steps go to: the open block, else the program
    fn target(&mut self) -> &mut Vec<Step> {
        match self.block.as_mut() {
            Some(block) => &mut block.steps,
            None => &mut self.def.steps,
        }
    }

    fn open_block(&mut self, kind: BlockKind, line: usize) -> Result<(), ParseError> {
        if let Some(open) = &self.block {
            return Err(ParseError::NestedBlock {
                kind: kind.name().to_string(),
                line,
                open_line: open.line,
            });
        }
        if !matches!(self.def.steps.last(), Some(Step::Run(_))) {
            return Err(ParseError::BlockWithoutRun {
                kind: kind.name().to_string(),
                line,
            });
        }
        debug!(kind = kind.name(), line, "open_block: opened");
        self.block = Some(OpenBlock {
            kind,
            line,
            steps: Vec::new(),
        });
        Ok(())
    }

    fn close_block(&mut self, line: usize) -> Result<(), ParseError> {
        let block = self.block.take().ok_or(ParseError::EndWithoutBlock { line })?;
        let run = self
            .def
            .steps
            .last_mut()
            .and_then(Step::as_run_mut)
            .ok_or_else(|| ParseError::BlockWithoutRun {
                kind: block.kind.name().to_string(),
                line: block.line,
            })?;
        debug!(kind = block.kind.name(), steps = block.steps.len(), "close_block: attaching");
        match block.kind {
            BlockKind::OnFailure => run.on_failure.extend(block.steps),
            BlockKind::OnSuccess => run.on_success.extend(block.steps),
        }
        Ok(())
    }

    /// Splice an included file's patterns, injections, steps and catalog
    fn include(&mut self, value: &str, line: usize) -> Result<(), ParseError> {
        let relative = value.trim();
        if relative.is_empty() {
            return Err(ParseError::InvalidValue {
                directive: "INCLUDE".to_string(),
                line,
                reason: "INCLUDE requires a path".to_string(),
            });
        }
        let path = self.base_dir.join(relative);
        let included = load_included(&path, line, self.guard)?;
        info!(path = %path.display(), steps = included.steps.len(), "Included workflow");

        if let Some(block) = &self.block
            && included.steps.iter().any(|s| s.as_run().is_some_and(RunStep::has_blocks))
        {
            return Err(ParseError::NestedBlock {
                kind: "INCLUDE".to_string(),
                line,
                open_line: block.line,
            });
        }

        self.def.context.extend(&included.context);
        self.def.injection.extend(&included.injection);
        self.def.refcat.extend(included.refcat);
        self.target().extend(included.steps);
        Ok(())
    }
}
