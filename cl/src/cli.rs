//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::context::SessionMode;
use crate::workflow::WorkflowOverrides;

/// Exit code used when a run stops with a pause record instead of completing
pub const EXIT_PAUSED: i32 = 2;

/// convoloop - directive-driven conversation workflows
#[derive(Parser)]
#[command(
    name = "cl",
    about = "Run directive-driven multi-cycle conversation workflows",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Overrides shared by `run` and `resume`
#[derive(Debug, Clone, Default, clap::Args)]
pub struct OverrideArgs {
    /// Backend adapter (overrides ADAPTER and the config default)
    #[arg(short, long)]
    pub adapter: Option<String>,

    /// Model name passed to the backend
    #[arg(short, long)]
    pub model: Option<String>,

    /// Number of cycles to run
    #[arg(long)]
    pub max_cycles: Option<u32>,

    /// Session mode (accumulate, compact, fresh)
    #[arg(long)]
    pub mode: Option<SessionMode>,

    /// Extra allow-list globs for files the backend may touch
    #[arg(long = "allow-files", value_name = "GLOB")]
    pub allow_files: Vec<String>,

    /// Extra deny-list globs
    #[arg(long = "deny-files", value_name = "GLOB")]
    pub deny_files: Vec<String>,

    /// Base directory for checkpoints (overrides config)
    #[arg(long, value_name = "DIR")]
    pub checkpoint_dir: Option<PathBuf>,
}

impl OverrideArgs {
    pub fn workflow_overrides(&self) -> WorkflowOverrides {
        debug!(?self, "OverrideArgs::workflow_overrides: called");
        WorkflowOverrides {
            model: self.model.clone(),
            adapter: self.adapter.clone(),
            max_cycles: self.max_cycles,
            mode: self.mode,
            allow_files: self.allow_files.clone(),
            deny_files: self.deny_files.clone(),
        }
    }
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a workflow file, inline workflow source, or a single prompt
    Run {
        /// Workflow file path, or prompt text
        #[arg(value_name = "WORKFLOW|PROMPT")]
        workflow: String,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Resume from a session directory or pause.json
    Resume {
        /// Session checkpoint directory or its pause.json
        checkpoint: PathBuf,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Parse a workflow and report problems without running it
    Validate {
        /// Workflow file path
        workflow: PathBuf,
    },

    /// Print the parsed workflow as normalized directive source
    Show {
        /// Workflow file path
        workflow: PathBuf,
    },

    /// Run a workflow once per component directory
    Apply {
        /// Workflow file path
        workflow: PathBuf,

        /// Glob selecting component directories
        #[arg(long, value_name = "GLOB")]
        components: String,

        /// Components run at once (overrides config)
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Backend adapter
        #[arg(short, long)]
        adapter: Option<String>,

        /// Base directory for checkpoints (overrides config)
        #[arg(long, value_name = "DIR")]
        checkpoint_dir: Option<PathBuf>,
    },

    /// List the pause record and named checkpoints of a session
    Checkpoints {
        /// Session checkpoint directory
        session: PathBuf,
    },

    /// List available backend adapters
    Adapters,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("convoloop")
        .join("logs")
        .join("convoloop.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Generate the after_help text with the log location
pub fn generate_after_help() -> String {
    debug!("generate_after_help: called");
    format!("Logs are written to: {}", get_log_path().display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::parse_from([
            "cl",
            "run",
            "flow.conv",
            "--adapter",
            "exec",
            "--max-cycles",
            "3",
            "--mode",
            "fresh",
            "--allow-files",
            "src/**",
            "--allow-files",
            "docs/**",
        ]);
        match cli.command {
            Command::Run { workflow, overrides } => {
                assert_eq!(workflow, "flow.conv");
                let o = overrides.workflow_overrides();
                assert_eq!(o.adapter.as_deref(), Some("exec"));
                assert_eq!(o.max_cycles, Some(3));
                assert_eq!(o.mode, Some(SessionMode::Fresh));
                assert_eq!(o.allow_files, vec!["src/**", "docs/**"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_mode_rejected() {
        assert!(Cli::try_parse_from(["cl", "run", "x", "--mode", "sometimes"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["cl", "adapters", "--log-level", "debug"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::Adapters));
    }

    #[test]
    fn test_apply_args() {
        let cli = Cli::parse_from(["cl", "apply", "flow.conv", "--components", "crates/*", "-p", "3"]);
        match cli.command {
            Command::Apply {
                components, parallel, ..
            } => {
                assert_eq!(components, "crates/*");
                assert_eq!(parallel, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
