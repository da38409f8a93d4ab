//! Serialize a definition back to directive source

use std::fmt::Write as _;

use tracing::debug;

use super::definition::{
    CheckpointPolicy, ContextLimitAction, DEFAULT_CONTEXT_LIMIT, OutputPolicy, RunOnError, VerifyOnError,
    WorkflowDefinition,
};
use super::step::{RunStep, Step};
use crate::context::SessionMode;

/// Accumulates directive lines
#[derive(Default)]
struct SourceWriter {
    out: String,
}

impl SourceWriter {
    fn line(&mut self, name: &str, value: impl AsRef<str>) {
        let value = value.as_ref();
        if value.is_empty() {
            let _ = writeln!(self.out, "{}", name);
        } else {
            let _ = writeln!(self.out, "{} {}", name, value);
        }
    }

    /// Paragraph directive: first line inline, the rest indented
    ///
    /// Text the indented form would alter (blank lines, surrounding
    /// whitespace, a leading quote) is written as one JSON string.
    fn paragraph(&mut self, name: &str, text: &str) {
        let plain = !text.is_empty()
            && !text.starts_with('"')
            && !text.ends_with('\n')
            && text.lines().all(|l| !l.is_empty() && l.trim() == l);
        if !plain {
            self.line(name, quoted(text));
            return;
        }
        let mut lines = text.lines();
        if let Some(first) = lines.next() {
            self.line(name, first);
        }
        for rest in lines {
            let _ = writeln!(self.out, "  {}", rest);
        }
    }

    fn all(&mut self, name: &str, values: &[String]) {
        for value in values {
            self.line(name, value);
        }
    }

    /// One directive per item, quoting items that would split
    fn items(&mut self, name: &str, values: &[String]) {
        for value in values {
            self.line(name, item(value));
        }
    }

    fn blank(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }
}

fn quoted(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

/// List item as written in a comma or whitespace separated value
fn item(value: &str) -> String {
    if value.is_empty() || value.starts_with('"') || value.contains(|c: char| c == ',' || c.is_whitespace()) {
        quoted(value)
    } else {
        value.to_string()
    }
}

impl WorkflowDefinition {
    /// Directive source that parses back to this definition
    pub fn to_source(&self) -> String {
        debug!(steps = self.steps.len(), "WorkflowDefinition::to_source: called");
        let mut w = SourceWriter::default();

        if let Some(model) = &self.model {
            w.line("MODEL", model);
        }
        if let Some(adapter) = &self.adapter {
            w.line("ADAPTER", adapter);
        }
        if self.mode != SessionMode::default() {
            w.line("MODE", self.mode.to_string());
        }
        if self.max_cycles != 1 {
            w.line("MAX-CYCLES", self.max_cycles.to_string());
        }
        if let Some(cwd) = &self.cwd {
            w.line("CWD", cwd.display().to_string());
        }

        w.all("CONTEXT", &self.context.required);
        w.all("CONTEXT-OPTIONAL", &self.context.optional);
        w.all("CONTEXT-EXCLUDE", &self.context.excluded);
        if self.context_limit != DEFAULT_CONTEXT_LIMIT {
            w.line("CONTEXT-LIMIT", self.context_limit.to_string());
        }
        if self.on_context_limit != ContextLimitAction::default() {
            w.line("ON-CONTEXT-LIMIT", self.on_context_limit.to_string());
        }
        if let Some(prompt) = &self.on_context_limit_prompt {
            w.paragraph("ON-CONTEXT-LIMIT-PROMPT", prompt);
        }

        w.items("ALLOW-FILES", &self.file_rules.allow);
        w.items("DENY-FILES", &self.file_rules.deny);

        w.all("PROLOGUE", &self.injection.prologues);
        w.all("EPILOGUE", &self.injection.epilogues);
        w.all("HEADER", &self.injection.headers);
        w.all("FOOTER", &self.injection.footers);
        w.all("REFCAT", &self.refcat);

        if let Some(summary) = &self.compaction.summary {
            w.paragraph("COMPACT-SUMMARY", summary);
        }
        if let Some(min) = self.compaction.min_density {
            w.line("COMPACTION-MIN", min.to_string());
        }
        if self.checkpoints.after != CheckpointPolicy::default() {
            w.line("CHECKPOINT-AFTER", self.checkpoints.after.to_string());
        }
        if let Some(name) = &self.checkpoints.name {
            w.line("CHECKPOINT-NAME", name);
        }

        if self.run.on_error != RunOnError::default() {
            w.line("RUN-ON-ERROR", self.run.on_error.to_string());
        }
        if self.run.output != OutputPolicy::default() {
            w.line("RUN-OUTPUT", self.run.output.to_string());
        }
        if self.run.timeout_secs != super::definition::DEFAULT_RUN_TIMEOUT_SECS {
            w.line("RUN-TIMEOUT", self.run.timeout_secs.to_string());
        }
        if let Some(cwd) = &self.run.cwd {
            w.line("RUN-CWD", cwd.display().to_string());
        }
        for (key, value) in &self.run.env {
            w.line("RUN-ENV", format!("{}={}", key, value));
        }
        if self.verify.on_error != VerifyOnError::default() {
            w.line("VERIFY-ON-ERROR", self.verify.on_error.to_string());
        }
        if self.verify.output != OutputPolicy::OnError {
            w.line("VERIFY-OUTPUT", self.verify.output.to_string());
        }
        if let Some(secs) = self.consult_timeout_secs {
            w.line("CONSULT-TIMEOUT", secs.to_string());
        }
        if let Some(path) = &self.output_file {
            w.line("OUTPUT-FILE", path.display().to_string());
        }

        w.blank();
        for step in &self.steps {
            write_step(&mut w, step);
        }
        w.out
    }
}

fn write_step(w: &mut SourceWriter, step: &Step) {
    match step {
        Step::Prompt { content } => w.paragraph("PROMPT", content),
        Step::Compact { preserve } => {
            let items: Vec<String> = preserve.iter().map(|p| item(p)).collect();
            w.line("COMPACT", items.join(", "))
        }
        Step::Checkpoint { name } => w.line("CHECKPOINT", name.as_deref().unwrap_or_default()),
        Step::Run(run) => write_run(w, run),
        Step::Verify { verifier, args } => w.line("VERIFY", format!("{} {}", verifier, args).trim_end()),
        Step::Pause { message } => w.line("PAUSE", message),
        Step::Consult { topic } => w.line("CONSULT", topic),
        Step::NewConversation => w.line("NEW-CONVERSATION", ""),
        Step::Elide => w.line("ELIDE", ""),
    }
}

fn write_run(w: &mut SourceWriter, run: &RunStep) {
    if !run.command.is_empty() {
        w.line("RUN", &run.command);
    }
    if run.retry_count > 0 || run.retry_prompt.is_some() {
        let value = match &run.retry_prompt {
            Some(prompt) => format!("{} \"{}\"", run.retry_count, prompt),
            None => run.retry_count.to_string(),
        };
        w.line("RUN-RETRY", value);
    }
    if !run.on_failure.is_empty() {
        w.line("ON-FAILURE", "");
        for step in &run.on_failure {
            write_step(w, step);
        }
        w.line("END", "");
    }
    if !run.on_success.is_empty() {
        w.line("ON-SUCCESS", "");
        for step in &run.on_success {
            write_step(w, step);
        }
        w.line("END", "");
    }
}
