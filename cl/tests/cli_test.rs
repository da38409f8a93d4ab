//! CLI integration tests
//!
//! Every test runs the `cl` binary inside a temp directory with the XDG
//! directories pointed into it, using the built-in `mock` adapter.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cl(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cl").expect("Failed to find cl binary");
    cmd.current_dir(temp.path())
        .env("HOME", temp.path())
        .env("XDG_DATA_HOME", temp.path().join("data"))
        .env("XDG_CONFIG_HOME", temp.path().join("config"))
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG");
    cmd
}

fn write(temp: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = temp.path().join(name);
    fs::write(&path, content).expect("Failed to write file");
    path
}

fn session_dirs(temp: &TempDir) -> Vec<PathBuf> {
    let base = temp.path().join(".convoloop/checkpoints");
    match fs::read_dir(&base) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

// =============================================================================
// Inspection commands
// =============================================================================

#[test]
fn test_adapters_lists_builtins() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    cl(&temp)
        .arg("adapters")
        .assert()
        .success()
        .stdout(predicate::str::contains("mock (default)"))
        .stdout(predicate::str::contains("exec"));
}

#[test]
fn test_validate_reports_counts() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    write(&temp, "flow.conv", "MAX-CYCLES 2\nPROMPT one\nPAUSE look\nPROMPT two\n");
    cl(&temp)
        .args(["validate", "flow.conv"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 steps, 2 prompts, 2 cycle(s)"))
        .stdout(predicate::str::contains("gate after prompt 1: look"));
}

#[test]
fn test_validate_rejects_broken_workflow() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    write(&temp, "broken.conv", "RUN make\nON-FAILURE\nPROMPT fix\n");
    cl(&temp)
        .args(["validate", "broken.conv"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("ON-FAILURE"));
}

#[test]
fn test_show_prints_normalized_source() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    write(&temp, "flow.conv", "# comment\nMODE fresh\nPROMPT hello\n");
    cl(&temp)
        .args(["show", "flow.conv"])
        .assert()
        .success()
        .stdout(predicate::str::contains("MODE fresh"))
        .stdout(predicate::str::contains("PROMPT hello"))
        .stdout(predicate::str::contains("# comment").not());
}

// =============================================================================
// Running
// =============================================================================

#[test]
fn test_run_inline_prompt() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    cl(&temp)
        .args(["run", "say hello to the team"])
        .assert()
        .success()
        .stdout(predicate::str::contains("say hello to the team"))
        .stdout(predicate::str::contains("Workflow completed"));
}

#[test]
fn test_run_pause_then_resume() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    write(&temp, "flow.conv", "PROMPT first\nPAUSE approve the plan\nPROMPT second\n");

    cl(&temp)
        .args(["run", "flow.conv"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Paused (pause): approve the plan"))
        .stdout(predicate::str::contains("cl resume"));

    let sessions = session_dirs(&temp);
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert!(session.join("pause.json").exists());

    cl(&temp)
        .args(["checkpoints"])
        .arg(session)
        .assert()
        .success()
        .stdout(predicate::str::contains("approve the plan"));

    cl(&temp)
        .arg("resume")
        .arg(session)
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow completed"));
    assert!(!session.join("pause.json").exists());
}

#[test]
fn test_run_failure_exits_nonzero_with_checkpoint() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    write(&temp, "flow.conv", "CONTEXT missing.md\nPROMPT go\n");
    cl(&temp)
        .args(["run", "flow.conv"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Missing required context files"))
        .stdout(predicate::str::contains("cl resume"));
}

#[test]
fn test_unknown_adapter_is_error() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    cl(&temp)
        .args(["run", "hello", "--adapter", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn test_apply_across_components() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    for name in ["api", "web"] {
        fs::create_dir_all(temp.path().join("services").join(name)).expect("Failed to create component");
    }
    write(&temp, "flow.conv", "PROMPT review {{component_name}}\nRUN touch reviewed.txt\n");

    cl(&temp)
        .args(["apply", "flow.conv", "--components", "services/*", "--parallel", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2/2 component(s) completed"));

    assert!(temp.path().join("services/api/reviewed.txt").exists());
    assert!(temp.path().join("services/web/reviewed.txt").exists());
}

#[test]
fn test_config_file_sets_scripted_replies() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    write(&temp, "custom.yml", "backend:\n  mock:\n    responses: [\"configured reply\"]\n");
    cl(&temp)
        .args(["--config", "custom.yml", "run", "anything"])
        .assert()
        .success()
        .stdout(predicate::str::contains("configured reply"));
}
