//! Workflow loading: files, inline text and INCLUDE resolution

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::apply::Applicator;
use super::definition::{Provenance, WorkflowDefinition};
use super::directive::{self, DirectiveKind};
use super::error::ParseError;

/// Stack of files currently being loaded, used to reject INCLUDE cycles
///
/// Shared across the whole recursion. A file may be included more than once
/// from different branches; only a file including one of its own ancestors
/// is an error.
#[derive(Debug, Default)]
pub struct IncludeGuard {
    chain: Vec<PathBuf>,
}

impl IncludeGuard {
    fn enter(&mut self, path: &Path) -> Result<(), ParseError> {
        if self.chain.iter().any(|p| p == path) {
            let chain = self
                .chain
                .iter()
                .chain(std::iter::once(&path.to_path_buf()))
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(ParseError::IncludeCycle { chain });
        }
        self.chain.push(path.to_path_buf());
        Ok(())
    }

    fn leave(&mut self) {
        self.chain.pop();
    }

    pub fn depth(&self) -> usize {
        self.chain.len()
    }
}

/// Load a workflow file and every file it includes
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition, ParseError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "load_workflow: called");
    let absolute = fs::canonicalize(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut guard = IncludeGuard::default();
    let def = load_guarded(&absolute, &mut guard)?;
    info!(
        path = %absolute.display(),
        steps = def.steps.len(),
        prompts = def.prompt_count(),
        "Loaded workflow"
    );
    Ok(def)
}

/// Parse workflow text, resolving INCLUDE against the current directory
pub fn parse_workflow(text: &str) -> Result<WorkflowDefinition, ParseError> {
    parse_workflow_in(text, ".")
}

/// Parse workflow text, resolving INCLUDE against `base_dir`
pub fn parse_workflow_in(text: &str, base_dir: impl AsRef<Path>) -> Result<WorkflowDefinition, ParseError> {
    debug!(base_dir = %base_dir.as_ref().display(), "parse_workflow_in: called");
    let mut guard = IncludeGuard::default();
    let def = WorkflowDefinition {
        source: Provenance::Inline(text.to_string()),
        ..Default::default()
    };
    Applicator::new(def, base_dir, &mut guard).apply_all(&directive::parse(text))
}

/// Load a workflow from a file path, or treat the argument as an ad hoc prompt
///
/// Text that names no existing file is parsed as workflow source when it
/// contains a PROMPT directive and otherwise becomes a single prompt.
pub fn load_or_inline(arg: &str) -> Result<WorkflowDefinition, ParseError> {
    let path = Path::new(arg);
    if path.is_file() {
        return load_workflow(path);
    }
    let has_prompt = directive::parse(arg)
        .iter()
        .any(|d| d.kind == DirectiveKind::Prompt);
    if has_prompt {
        debug!("load_or_inline: parsing inline workflow source");
        parse_workflow(arg)
    } else {
        debug!("load_or_inline: treating argument as a single prompt");
        Ok(WorkflowDefinition::from_prompts([arg.trim()]))
    }
}

/// Load a file referenced by INCLUDE at `line` of the including file
pub(crate) fn load_included(path: &Path, line: usize, guard: &mut IncludeGuard) -> Result<WorkflowDefinition, ParseError> {
    let absolute = fs::canonicalize(path).map_err(|_| ParseError::IncludeNotFound {
        path: path.to_path_buf(),
        line,
    })?;
    load_guarded(&absolute, guard)
}

fn load_guarded(absolute: &Path, guard: &mut IncludeGuard) -> Result<WorkflowDefinition, ParseError> {
    guard.enter(absolute)?;
    debug!(path = %absolute.display(), depth = guard.depth(), "load_guarded: entered");

    let result = read_and_apply(absolute, guard);
    guard.leave();
    result
}

fn read_and_apply(absolute: &Path, guard: &mut IncludeGuard) -> Result<WorkflowDefinition, ParseError> {
    let text = fs::read_to_string(absolute).map_err(|source| ParseError::Io {
        path: absolute.to_path_buf(),
        source,
    })?;
    let base_dir = absolute.parent().map(Path::to_path_buf).unwrap_or_default();
    let def = WorkflowDefinition {
        source: Provenance::File(absolute.to_path_buf()),
        ..Default::default()
    };
    Applicator::new(def, base_dir, guard).apply_all(&directive::parse(&text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Step;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_load_workflow_file() {
        let temp = TempDir::new().unwrap();
        let path = write(temp.path(), "review.conv", "MODEL m\nPROMPT one\nPROMPT two\n");

        let def = load_workflow(&path).unwrap();

        assert_eq!(def.prompts(), vec!["one", "two"]);
        assert_eq!(def.name(), "review");
        assert!(def.source_path().is_some());
    }

    #[test]
    fn test_include_splices_steps_and_context() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "shared/common.conv",
            "MODEL ignored\nCONTEXT lib/*.rs\nPROLOGUE be brief\nPROMPT shared prompt\n",
        );
        let main = write(
            temp.path(),
            "main.conv",
            "MODEL kept\nPROMPT first\nINCLUDE shared/common.conv\nPROMPT last\n",
        );

        let def = load_workflow(&main).unwrap();

        assert_eq!(def.prompts(), vec!["first", "shared prompt", "last"]);
        assert_eq!(def.model.as_deref(), Some("kept"));
        assert_eq!(def.context.required, vec!["lib/*.rs"]);
        assert_eq!(def.injection.prologues, vec!["be brief"]);
    }

    #[test]
    fn test_nested_include_resolves_relative_to_includer() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a/b/leaf.conv", "PROMPT leaf\n");
        write(temp.path(), "a/mid.conv", "INCLUDE b/leaf.conv\n");
        let main = write(temp.path(), "main.conv", "INCLUDE a/mid.conv\n");

        let def = load_workflow(&main).unwrap();
        assert_eq!(def.prompts(), vec!["leaf"]);
    }

    #[test]
    fn test_include_cycle_names_both_files() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.conv", "PROMPT a\nINCLUDE b.conv\n");
        write(temp.path(), "b.conv", "PROMPT b\nINCLUDE a.conv\n");

        let err = load_workflow(temp.path().join("a.conv")).unwrap_err();

        let message = err.to_string();
        assert!(matches!(err, ParseError::IncludeCycle { .. }));
        assert!(message.contains("a.conv"));
        assert!(message.contains("b.conv"));
    }

    #[test]
    fn test_self_include_is_cycle() {
        let temp = TempDir::new().unwrap();
        let path = write(temp.path(), "self.conv", "INCLUDE self.conv\n");
        assert!(matches!(load_workflow(&path), Err(ParseError::IncludeCycle { .. })));
    }

    #[test]
    fn test_diamond_include_is_allowed() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "shared.conv", "PROMPT shared\n");
        write(temp.path(), "left.conv", "INCLUDE shared.conv\n");
        write(temp.path(), "right.conv", "INCLUDE shared.conv\n");
        let main = write(temp.path(), "main.conv", "INCLUDE left.conv\nINCLUDE right.conv\n");

        let def = load_workflow(&main).unwrap();
        assert_eq!(def.prompts(), vec!["shared", "shared"]);
    }

    #[test]
    fn test_missing_include_reports_line() {
        let temp = TempDir::new().unwrap();
        let main = write(temp.path(), "main.conv", "PROMPT a\nINCLUDE nope.conv\n");

        let err = load_workflow(&main).unwrap_err();
        assert!(matches!(err, ParseError::IncludeNotFound { line: 2, .. }));
    }

    #[test]
    fn test_include_inside_block() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "fix.conv", "PROMPT please fix\n");
        let main = write(temp.path(), "main.conv", "RUN make\nON-FAILURE\nINCLUDE fix.conv\nEND\n");

        let def = load_workflow(&main).unwrap();
        let run = def.steps[0].as_run().unwrap();
        assert_eq!(run.on_failure, vec![Step::prompt("please fix")]);
    }

    #[test]
    fn test_load_or_inline() {
        let def = load_or_inline("just do the thing").unwrap();
        assert_eq!(def.prompts(), vec!["just do the thing"]);
        assert_eq!(def.name(), "inline");

        let def = load_or_inline("MAX-CYCLES 2\nPROMPT a\nPROMPT b").unwrap();
        assert_eq!(def.max_cycles, 2);
        assert_eq!(def.prompt_count(), 2);
    }
}
