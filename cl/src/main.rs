//! convoloop - directive-driven conversation workflows
//!
//! CLI entry point for running, resuming and inspecting workflows.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::{CommandFactory, FromArgMatches};
use colored::*;
use eyre::{Context, Result, eyre};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use convoloop::backend::{AdapterRegistry, Backend, StreamEvent};
use convoloop::batch::{ComponentOutcome, apply_components, resolve_components};
use convoloop::checkpoint::CheckpointStore;
use convoloop::cli::{Cli, Command, EXIT_PAUSED, OverrideArgs, generate_after_help, get_log_path};
use convoloop::config::Config;
use convoloop::engine::{EngineOptions, ExecutionEngine, RunOutcome, load_from_pause};
use convoloop::workflow::{WorkflowDefinition, load_or_inline, load_workflow};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;
    info!(adapter = %config.backend.adapter, "convoloop loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    let code = match cli.command {
        Command::Run { workflow, overrides } => cmd_run(&config, &workflow, &overrides).await?,
        Command::Resume { checkpoint, overrides } => cmd_resume(&config, &checkpoint, &overrides).await?,
        Command::Validate { workflow } => cmd_validate(&config, &workflow)?,
        Command::Show { workflow } => cmd_show(&workflow)?,
        Command::Apply {
            workflow,
            components,
            parallel,
            adapter,
            checkpoint_dir,
        } => cmd_apply(&config, &workflow, &components, parallel, adapter, checkpoint_dir).await?,
        Command::Checkpoints { session } => cmd_checkpoints(&session)?,
        Command::Adapters => cmd_adapters(&config),
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn engine_options(config: &Config, checkpoint_dir: Option<PathBuf>) -> Result<EngineOptions> {
    let workdir = std::env::current_dir().context("Failed to read current directory")?;
    let mut options = config.engine_options(workdir);
    if let Some(dir) = checkpoint_dir {
        options.checkpoint_dir = dir;
    }
    Ok(options)
}

/// Adapter priority: CLI flag > workflow ADAPTER > config default
fn create_backend(config: &Config, workflow: &WorkflowDefinition, cli_adapter: Option<&str>) -> Result<Arc<dyn Backend>> {
    let adapter = cli_adapter
        .or(workflow.adapter.as_deref())
        .unwrap_or(&config.backend.adapter);
    debug!(%adapter, "create_backend: called");
    let registry = AdapterRegistry::with_builtins(&config.backend);
    registry
        .create(adapter)
        .context(format!("Failed to create '{}' backend", adapter))
}

async fn cmd_run(config: &Config, arg: &str, overrides: &OverrideArgs) -> Result<i32> {
    debug!(%arg, "cmd_run: called");
    let workflow = load_or_inline(arg)
        .context("Failed to load workflow")?
        .with_overrides(&overrides.workflow_overrides());
    let backend = create_backend(config, &workflow, overrides.adapter.as_deref())?;
    let options = engine_options(config, overrides.checkpoint_dir.clone())?;

    println!("Running {} ({})", workflow.name().cyan(), backend.name());
    println!("  Steps: {}", workflow.steps.len());
    println!("  Max cycles: {}", workflow.max_cycles);
    println!("  Mode: {}", workflow.mode);
    println!();

    let engine = ExecutionEngine::new(workflow, backend, options)?;
    drive(engine, false).await
}

async fn cmd_resume(config: &Config, checkpoint: &Path, overrides: &OverrideArgs) -> Result<i32> {
    debug!(checkpoint = %checkpoint.display(), "cmd_resume: called");
    let store = CheckpointStore::at(checkpoint);
    let record = store.require_pause().context("No pause record to resume from")?;
    let adapter = overrides
        .adapter
        .clone()
        .unwrap_or_else(|| config.backend.adapter.clone());
    let registry = AdapterRegistry::with_builtins(&config.backend);
    let backend = registry
        .create(&adapter)
        .context(format!("Failed to create '{}' backend", adapter))?;
    let options = engine_options(config, overrides.checkpoint_dir.clone())?;

    println!(
        "Resuming session {} ({}, cycle {}, prompt {})",
        record.session_id.cyan(),
        record.reason,
        record.cycle_number + 1,
        record.prompt_index
    );
    if let Some(expires_at) = record.expires_at
        && record.is_expired(chrono::Utc::now())
    {
        println!("  {} consultation expired at {}", "⚠".yellow(), expires_at);
    }
    println!();

    let engine = load_from_pause(checkpoint, backend, options, &overrides.workflow_overrides())?;
    drive(engine, true).await
}

/// Run an engine to its outcome, printing streamed output and the result
async fn drive(engine: ExecutionEngine, resumed: bool) -> Result<i32> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Chunk(text) => println!("{}\n", text),
                StreamEvent::Reasoning(text) => println!("{}\n", text.dimmed()),
            }
        }
    });

    let stop = engine.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Stopping after the current step...", "⚠".yellow());
            stop.store(true, Ordering::SeqCst);
        }
    });

    let mut engine = engine.with_events(tx);
    let result = engine.run().await;
    // Dropping the engine closes the event channel so the printer can finish
    let store = engine.store().clone();
    let session_id = engine.session_id().to_string();
    drop(engine);
    if let Err(e) = printer.await {
        warn!(error = %e, "Output printer task failed");
    }

    match result {
        Ok(RunOutcome::Completed) => {
            if resumed && let Err(e) = store.delete_pause() {
                warn!(error = %e, "Failed to remove pause record after resume");
            }
            println!("{} Workflow completed (session {})", "✓".green(), session_id);
            Ok(0)
        }
        Ok(RunOutcome::Paused {
            reason,
            message,
            checkpoint,
            retry_after,
        }) => {
            println!("{} Paused ({}): {}", "⏸".yellow(), reason, message);
            if let Some(retry_after) = retry_after {
                println!("  Retry after: {:?}", retry_after);
            }
            println!("  Resume with: cl resume {}", checkpoint.display());
            Ok(EXIT_PAUSED)
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            if let Some(checkpoint) = e.checkpoint() {
                println!("  Resume with: cl resume {}", checkpoint.display());
            }
            Ok(1)
        }
    }
}

fn cmd_validate(config: &Config, path: &Path) -> Result<i32> {
    debug!(path = %path.display(), "cmd_validate: called");
    let workflow = match load_workflow(path) {
        Ok(workflow) => workflow,
        Err(e) => {
            println!("{} {}: {}", "✗".red(), path.display(), e);
            return Ok(1);
        }
    };

    let mut warnings = Vec::new();
    let registry = AdapterRegistry::with_builtins(&config.backend);
    if let Some(adapter) = &workflow.adapter
        && !registry.contains(adapter)
    {
        warnings.push(format!(
            "ADAPTER '{}' is not registered (available: {})",
            adapter,
            registry.names().join(", ")
        ));
    }
    if workflow.prompt_count() == 0 {
        warnings.push("workflow has no PROMPT steps".to_string());
    }

    println!(
        "{} {}: {} steps, {} prompts, {} cycle(s)",
        "✓".green(),
        path.display(),
        workflow.steps.len(),
        workflow.prompt_count(),
        workflow.max_cycles
    );
    for (anchor, message) in workflow.pause_points() {
        let after = anchor.map(|i| format!("after prompt {}", i + 1)).unwrap_or_else(|| "before first prompt".to_string());
        println!("  gate {}: {}", after, message);
    }
    for warning in &warnings {
        println!("  {} {}", "⚠".yellow(), warning);
    }
    Ok(0)
}

fn cmd_show(path: &Path) -> Result<i32> {
    debug!(path = %path.display(), "cmd_show: called");
    let workflow = load_workflow(path).context(format!("Failed to load {}", path.display()))?;
    print!("{}", workflow.to_source());
    Ok(0)
}

async fn cmd_apply(
    config: &Config,
    path: &Path,
    pattern: &str,
    parallel: Option<usize>,
    adapter: Option<String>,
    checkpoint_dir: Option<PathBuf>,
) -> Result<i32> {
    debug!(path = %path.display(), %pattern, ?parallel, "cmd_apply: called");
    let workflow = load_workflow(path).context(format!("Failed to load {}", path.display()))?;
    let options = engine_options(config, checkpoint_dir)?;
    let components = resolve_components(pattern, &options.workdir)?;
    let adapter = adapter
        .or_else(|| workflow.adapter.clone())
        .unwrap_or_else(|| config.backend.adapter.clone());
    let max_parallel = parallel.unwrap_or(config.concurrency.max_parallel);
    let registry = AdapterRegistry::with_builtins(&config.backend);

    println!(
        "Applying {} to {} component(s), {} at a time",
        workflow.name().cyan(),
        components.len(),
        max_parallel.max(1)
    );
    let reports = apply_components(&workflow, &components, &registry, &adapter, &options, max_parallel).await?;

    let mut failed = 0;
    for report in &reports {
        let component = report.component.display();
        match &report.outcome {
            ComponentOutcome::Completed => println!("  {} {}", "✓".green(), component),
            ComponentOutcome::Paused { reason, checkpoint } => {
                failed += 1;
                println!("  {} {} ({}) -> {}", "⏸".yellow(), component, reason, checkpoint.display());
            }
            ComponentOutcome::Failed { error, .. } => {
                failed += 1;
                println!("  {} {}: {}", "✗".red(), component, error);
            }
        }
    }
    println!("{}/{} component(s) completed", reports.len() - failed, reports.len());
    Ok(if failed == 0 { 0 } else { 1 })
}

fn cmd_checkpoints(session: &Path) -> Result<i32> {
    debug!(session = %session.display(), "cmd_checkpoints: called");
    if !session.exists() {
        return Err(eyre!("No session directory at {}", session.display()));
    }
    let store = CheckpointStore::at(session);

    match store.read_pause()? {
        Some(record) => {
            println!("{} ({})", "Pause record".bold(), record.status);
            println!("  Reason:  {}", record.reason);
            println!("  Message: {}", record.message);
            println!("  Cycle:   {}, prompt {}", record.cycle_number + 1, record.prompt_index);
            println!("  Written: {}", record.timestamp);
        }
        None => println!("No pause record"),
    }

    let checkpoints = store.list_checkpoints()?;
    if checkpoints.is_empty() {
        println!("No named checkpoints");
    } else {
        println!("{}", "Checkpoints".bold());
        for (path, checkpoint) in checkpoints {
            println!(
                "  {:<24} cycle {:<3} {} {}",
                checkpoint.name.yellow(),
                checkpoint.cycle_number + 1,
                checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S"),
                path.display().to_string().dimmed()
            );
        }
    }
    Ok(0)
}

fn cmd_adapters(config: &Config) -> i32 {
    debug!("cmd_adapters: called");
    let registry = AdapterRegistry::with_builtins(&config.backend);
    for name in registry.names() {
        if name == config.backend.adapter {
            println!("{} (default)", name.green());
        } else {
            println!("{}", name);
        }
    }
    0
}
