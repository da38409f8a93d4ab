//! Rebuilding an engine from a pause record

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::engine::{EngineOptions, ExecutionEngine};
use super::error::EngineError;
use crate::backend::Backend;
use crate::checkpoint::CheckpointStore;
use crate::workflow::{WorkflowDefinition, WorkflowOverrides, load_workflow, parse_workflow_in};

/// Load the pause record at `location` and return an engine ready to `run`
///
/// `location` is a session directory or a `pause.json` inside one. The
/// workflow is reloaded from its file when it still exists, otherwise from
/// the source stored in the record.
pub fn load_from_pause(
    location: &Path,
    backend: Arc<dyn Backend>,
    options: EngineOptions,
    overrides: &WorkflowOverrides,
) -> Result<ExecutionEngine, EngineError> {
    debug!(location = %location.display(), "load_from_pause: called");
    let store = CheckpointStore::at(location);
    let record = store.require_pause()?;

    let workflow = resolve_workflow(
        record.workflow_path.as_deref(),
        record.workflow_content.as_deref(),
        &store.pause_path(),
    )?
    .with_overrides(overrides);

    info!(
        session_id = %record.session_id,
        reason = %record.reason,
        cycle = record.cycle_number + 1,
        prompt_index = record.prompt_index,
        "Resuming session"
    );
    let mut engine = ExecutionEngine::new(workflow, backend, options)?;
    engine.restore(record, store);
    Ok(engine)
}

fn resolve_workflow(
    path: Option<&Path>,
    content: Option<&str>,
    pause_file: &Path,
) -> Result<WorkflowDefinition, EngineError> {
    if let Some(path) = path
        && path.exists()
    {
        return Ok(load_workflow(path)?);
    }
    if let Some(content) = content {
        let base = path
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| ".".into());
        debug!(base = %base.display(), "resolve_workflow: using stored workflow source");
        return Ok(parse_workflow_in(content, &base)?);
    }
    let missing = path
        .map(|p| format!("workflow file {} no longer exists", p.display()))
        .unwrap_or_else(|| "no workflow path or content".to_string());
    Err(EngineError::Resume(format!("{} (pause record: {})", missing, pause_file.display())))
}
