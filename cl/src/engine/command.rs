//! External command execution for RUN steps

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// What to run and how
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, cwd: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.as_ref().to_path_buf(),
            env: BTreeMap::new(),
            timeout,
        }
    }
}

/// Result of running a command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal, timed out or never started)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Output formatted for inclusion in the next prompt
    pub fn render(&self, command: &str) -> String {
        let mut text = format!("$ {}\n", command);
        if self.timed_out {
            text.push_str("(timed out)\n");
        } else {
            text.push_str(&format!("(exit code {})\n", self.exit_code));
        }
        let stdout = self.stdout.trim_end();
        if !stdout.is_empty() {
            text.push_str(stdout);
            text.push('\n');
        }
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            text.push_str("stderr:\n");
            text.push_str(stderr);
            text.push('\n');
        }
        text
    }

    fn failed_to_start(message: String, duration_ms: u64) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message,
            duration_ms,
            timed_out: false,
        }
    }
}

/// Run `spec.command` through `sh -c`
///
/// Never fails: spawn errors and timeouts become a failed [`CommandOutput`]
/// so the caller's on-error policy decides what happens next.
pub async fn run_command(spec: &CommandSpec) -> CommandOutput {
    debug!(command = %spec.command, cwd = %spec.cwd.display(), timeout_ms = spec.timeout.as_millis() as u64, "run_command: called");
    let start = Instant::now();

    if spec.command.trim().is_empty() {
        debug!("run_command: empty command");
        return CommandOutput::failed_to_start("RUN has no command".to_string(), 0);
    }

    let output = tokio::time::timeout(
        spec.timeout,
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let duration_ms = start.elapsed().as_millis() as u64;
    match output {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            debug!(exit_code, duration_ms, "run_command: command completed");
            CommandOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration_ms,
                timed_out: false,
            }
        }
        Ok(Err(e)) => {
            warn!(command = %spec.command, error = %e, "Command failed to start");
            CommandOutput::failed_to_start(format!("failed to start: {}", e), duration_ms)
        }
        Err(_) => {
            warn!(command = %spec.command, timeout_secs = spec.timeout.as_secs(), "Command timed out");
            CommandOutput {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("timed out after {}s", spec.timeout.as_secs()),
                duration_ms,
                timed_out: true,
            }
        }
    }
}
