//! Handlebars rendering for prompt text and templated workflow views

use std::collections::BTreeMap;
use std::path::PathBuf;

use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use super::definition::WorkflowDefinition;
use super::step::Step;

/// Variables the engine supplies when a prompt is sent
pub const RUNTIME_VARS: &[&str] = &["cycle_number", "max_cycles", "session_id", "workflow_name", "date"];

/// Per-prompt variables available to `{{...}}` placeholders
#[derive(Debug, Clone, Serialize)]
pub struct PromptVars {
    pub cycle_number: u32,
    pub max_cycles: u32,
    pub session_id: String,
    pub workflow_name: String,
    pub date: String,
}

/// Renders text through handlebars without HTML escaping
pub struct TemplateRenderer {
    hbs: Handlebars<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);
        Self { hbs }
    }

    /// Render `text` against `data`; text without placeholders is returned as is
    pub fn render<T: Serialize>(&self, text: &str, data: &T) -> Result<String, String> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }
        self.hbs.render_template(text, data).map_err(|e| e.to_string())
    }
}

impl WorkflowDefinition {
    /// Fresh copy with `vars` substituted into every text field
    ///
    /// Runtime placeholders (`{{cycle_number}}` and friends) are left intact
    /// unless `vars` names them, so the engine can still fill them per prompt.
    pub fn templated(&self, vars: &BTreeMap<String, String>) -> Result<WorkflowDefinition, String> {
        debug!(var_count = vars.len(), "WorkflowDefinition::templated: called");
        let mut data = vars.clone();
        for name in RUNTIME_VARS {
            data.entry((*name).to_string())
                .or_insert_with(|| format!("{{{{{}}}}}", name));
        }
        let renderer = TemplateRenderer::new();
        let render = |text: &str| renderer.render(text, &data);
        let render_all = |items: &[String]| items.iter().map(|s| render(s)).collect::<Result<Vec<_>, _>>();

        let mut def = self.clone();
        def.context.required = render_all(&self.context.required)?;
        def.context.optional = render_all(&self.context.optional)?;
        def.context.excluded = render_all(&self.context.excluded)?;
        def.injection.prologues = render_all(&self.injection.prologues)?;
        def.injection.epilogues = render_all(&self.injection.epilogues)?;
        def.injection.headers = render_all(&self.injection.headers)?;
        def.injection.footers = render_all(&self.injection.footers)?;
        def.on_context_limit_prompt = self.on_context_limit_prompt.as_deref().map(render).transpose()?;
        def.compaction.summary = self.compaction.summary.as_deref().map(render).transpose()?;
        def.output_file = self
            .output_file
            .as_ref()
            .map(|p| render(&p.to_string_lossy()).map(PathBuf::from))
            .transpose()?;
        def.steps = render_steps(&self.steps, &render)?;
        Ok(def)
    }
}

fn render_steps<F>(steps: &[Step], render: &F) -> Result<Vec<Step>, String>
where
    F: Fn(&str) -> Result<String, String>,
{
    steps
        .iter()
        .map(|step| {
            Ok(match step {
                Step::Prompt { content } => Step::Prompt {
                    content: render(content)?,
                },
                Step::Run(run) => {
                    let mut run = run.clone();
                    run.command = render(&run.command)?;
                    run.retry_prompt = run.retry_prompt.as_deref().map(render).transpose()?;
                    run.on_failure = render_steps(&run.on_failure, render)?;
                    run.on_success = render_steps(&run.on_success, render)?;
                    Step::Run(run)
                }
                Step::Verify { verifier, args } => Step::Verify {
                    verifier: verifier.clone(),
                    args: render(args)?,
                },
                Step::Pause { message } => Step::Pause {
                    message: render(message)?,
                },
                Step::Consult { topic } => Step::Consult { topic: render(topic)? },
                other => other.clone(),
            })
        })
        .collect()
}
