//! Apply one workflow to many components in parallel
//!
//! Each component gets a templated view of the workflow (`{{component}}`
//! and `{{component_name}}` filled in), its own backend from the adapter
//! registry and its own engine and session. A semaphore caps how many run
//! at once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result, eyre};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backend::AdapterRegistry;
use crate::checkpoint::PauseReason;
use crate::engine::{EngineOptions, ExecutionEngine, RunOutcome};
use crate::workflow::WorkflowDefinition;

/// How one component's run ended
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentOutcome {
    Completed,
    Paused { reason: PauseReason, checkpoint: PathBuf },
    Failed { error: String, checkpoint: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentReport {
    pub component: PathBuf,
    /// Engine session id; empty when the engine could not be built
    pub session_id: String,
    pub outcome: ComponentOutcome,
}

impl ComponentReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ComponentOutcome::Completed)
    }
}

/// Directories matching `pattern`, relative to `workdir` unless absolute
pub fn resolve_components(pattern: &str, workdir: &Path) -> Result<Vec<PathBuf>> {
    debug!(%pattern, workdir = %workdir.display(), "resolve_components: called");
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        workdir.join(pattern).to_string_lossy().into_owned()
    };
    let mut components: Vec<PathBuf> = glob::glob(&full)
        .context(format!("Invalid component pattern '{}'", pattern))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_dir())
        .collect();
    components.sort();
    if components.is_empty() {
        return Err(eyre!("No component directories match '{}'", pattern));
    }
    Ok(components)
}

/// Variables for a component's view of the workflow
fn component_vars(component: &Path) -> BTreeMap<String, String> {
    let name = component
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| component.display().to_string());
    BTreeMap::from([
        ("component".to_string(), component.display().to_string()),
        ("component_name".to_string(), name),
    ])
}

/// Run `workflow` once per component, at most `max_parallel` at a time
///
/// Every component runs to its own outcome; one failure does not stop the
/// others. Reports come back in component order.
pub async fn apply_components(
    workflow: &WorkflowDefinition,
    components: &[PathBuf],
    registry: &AdapterRegistry,
    adapter: &str,
    options: &EngineOptions,
    max_parallel: usize,
) -> Result<Vec<ComponentReport>> {
    let max_parallel = max_parallel.max(1);
    info!(
        workflow = %workflow.name(),
        components = components.len(),
        max_parallel,
        %adapter,
        "Applying workflow to components"
    );
    if !registry.contains(adapter) {
        return Err(eyre!(
            "Unknown adapter '{}' (available: {})",
            adapter,
            registry.names().join(", ")
        ));
    }

    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let runs = components.iter().map(|component| {
        let semaphore = Arc::clone(&semaphore);
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| eyre!("Concurrency limiter closed: {}", e))?;
            Ok::<_, eyre::Report>(run_component(workflow, component, registry, adapter, options).await)
        }
    });

    let reports = join_all(runs).await.into_iter().collect::<Result<Vec<_>>>()?;
    let failed = reports.iter().filter(|r| !r.is_success()).count();
    info!(total = reports.len(), failed, "Finished applying workflow");
    Ok(reports)
}

async fn run_component(
    workflow: &WorkflowDefinition,
    component: &Path,
    registry: &AdapterRegistry,
    adapter: &str,
    options: &EngineOptions,
) -> ComponentReport {
    debug!(component = %component.display(), "run_component: called");
    let failed = |error: String| ComponentReport {
        component: component.to_path_buf(),
        session_id: String::new(),
        outcome: ComponentOutcome::Failed {
            error,
            checkpoint: None,
        },
    };

    let mut view = match workflow.templated(&component_vars(component)) {
        Ok(view) => view,
        Err(e) => return failed(format!("template error: {}", e)),
    };
    if view.cwd.is_none() {
        view.cwd = Some(component.to_path_buf());
    }
    let backend = match registry.create(adapter) {
        Ok(backend) => backend,
        Err(e) => return failed(e.to_string()),
    };
    let mut engine = match ExecutionEngine::new(view, backend, options.clone()) {
        Ok(engine) => engine,
        Err(e) => return failed(e.to_string()),
    };
    let session_id = engine.session_id().to_string();

    let outcome = match engine.run().await {
        Ok(RunOutcome::Completed) => {
            info!(component = %component.display(), %session_id, "Component completed");
            ComponentOutcome::Completed
        }
        Ok(RunOutcome::Paused { reason, checkpoint, .. }) => {
            info!(component = %component.display(), %reason, "Component paused");
            ComponentOutcome::Paused { reason, checkpoint }
        }
        Err(e) => {
            warn!(component = %component.display(), error = %e, "Component failed");
            ComponentOutcome::Failed {
                checkpoint: e.checkpoint().map(Path::to_path_buf),
                error: e.to_string(),
            }
        }
    };
    ComponentReport {
        component: component.to_path_buf(),
        session_id,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MockBackend};
    use crate::detector::LoopDetectorConfig;
    use crate::workflow::parse_workflow;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Vec<PathBuf>) {
        let temp = TempDir::new().unwrap();
        for name in ["alpha", "beta", "gamma"] {
            std::fs::create_dir(temp.path().join(name)).unwrap();
        }
        std::fs::write(temp.path().join("notes.txt"), "not a component").unwrap();
        let components = resolve_components("*", temp.path()).unwrap();
        (temp, components)
    }

    fn options(temp: &TempDir) -> EngineOptions {
        EngineOptions {
            workdir: temp.path().to_path_buf(),
            checkpoint_dir: temp.path().join(".checkpoints"),
            loop_detection: LoopDetectorConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn shared(backend: &Arc<MockBackend>) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        let backend = Arc::clone(backend);
        registry.register("shared", move || Ok(Arc::clone(&backend) as Arc<dyn Backend>));
        registry
    }

    #[test]
    fn test_resolve_components_only_dirs() {
        let (_temp, components) = setup();
        let names: Vec<String> = components
            .iter()
            .map(|c| c.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_resolve_components_no_match() {
        let temp = TempDir::new().unwrap();
        assert!(resolve_components("missing-*", temp.path()).is_err());
    }

    #[tokio::test]
    async fn test_apply_renders_component_view() {
        let (temp, components) = setup();
        let backend = Arc::new(MockBackend::new());
        let workflow = parse_workflow("PROMPT review {{component_name}} in cycle {{cycle_number}}\n").unwrap();

        let reports = apply_components(&workflow, &components, &shared(&backend), "shared", &options(&temp), 2)
            .await
            .unwrap();

        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(ComponentReport::is_success));
        let mut sent = backend.sent();
        sent.sort();
        assert_eq!(
            sent,
            vec!["review alpha in cycle 1", "review beta in cycle 1", "review gamma in cycle 1"]
        );
        let sessions: std::collections::BTreeSet<&str> = reports.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(sessions.len(), 3);
    }

    #[tokio::test]
    async fn test_commands_run_inside_component() {
        let (temp, components) = setup();
        let backend = Arc::new(MockBackend::new());
        let workflow = parse_workflow("RUN touch marker.txt\n").unwrap();

        apply_components(&workflow, &components, &shared(&backend), "shared", &options(&temp), 1)
            .await
            .unwrap();

        for component in &components {
            assert!(component.join("marker.txt").exists());
        }
    }

    #[tokio::test]
    async fn test_failure_in_one_component_does_not_stop_others() {
        let (temp, components) = setup();
        std::fs::write(components[1].join("required.md"), "present").unwrap();
        let backend = Arc::new(MockBackend::new());
        let workflow = parse_workflow("CONTEXT required.md\nPROMPT go\n").unwrap();

        let reports = apply_components(&workflow, &components, &shared(&backend), "shared", &options(&temp), 3)
            .await
            .unwrap();

        assert!(!reports[0].is_success());
        assert!(reports[1].is_success());
        assert!(!reports[2].is_success());
        assert!(matches!(
            &reports[0].outcome,
            ComponentOutcome::Failed { checkpoint: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_adapter_rejected() {
        let (temp, components) = setup();
        let workflow = parse_workflow("PROMPT go\n").unwrap();
        let registry = AdapterRegistry::new();
        let result = apply_components(&workflow, &components, &registry, "nope", &options(&temp), 1).await;
        assert!(result.is_err());
    }
}
