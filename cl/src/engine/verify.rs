//! Verifiers for VERIFY steps
//!
//! A verifier checks some property of the working directory and reports
//! pass or fail with output for the next prompt. Verifiers are looked up by
//! name in a [`VerifierRegistry`] owned by the engine.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::command::{CommandSpec, run_command};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub output: String,
}

impl VerifyOutcome {
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str;

    /// Check `args` against `workdir`
    async fn verify(&self, args: &str, workdir: &Path) -> VerifyOutcome;
}

/// Every whitespace-separated glob must match at least one existing file
#[derive(Debug, Default)]
pub struct PathsVerifier;

#[async_trait]
impl Verifier for PathsVerifier {
    fn name(&self) -> &str {
        "paths"
    }

    async fn verify(&self, args: &str, workdir: &Path) -> VerifyOutcome {
        debug!(%args, workdir = %workdir.display(), "PathsVerifier::verify: called");
        let patterns: Vec<&str> = args.split_whitespace().collect();
        if patterns.is_empty() {
            return VerifyOutcome::fail("paths: no patterns given");
        }

        let mut missing = Vec::new();
        let mut report = String::new();
        for pattern in patterns {
            let full = if Path::new(pattern).is_absolute() {
                pattern.to_string()
            } else {
                workdir.join(pattern).to_string_lossy().into_owned()
            };
            let found = match glob::glob(&full) {
                Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.exists()).count(),
                Err(e) => {
                    report.push_str(&format!("{}: invalid pattern ({})\n", pattern, e.msg));
                    missing.push(pattern);
                    continue;
                }
            };
            if found == 0 {
                report.push_str(&format!("{}: missing\n", pattern));
                missing.push(pattern);
            } else {
                report.push_str(&format!("{}: {} match(es)\n", pattern, found));
            }
        }

        if missing.is_empty() {
            VerifyOutcome::pass(report)
        } else {
            VerifyOutcome::fail(report)
        }
    }
}

/// Runs `args` as a shell command; passes on exit code 0
#[derive(Debug)]
pub struct CommandVerifier {
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    fn name(&self) -> &str {
        "command"
    }

    async fn verify(&self, args: &str, workdir: &Path) -> VerifyOutcome {
        debug!(%args, "CommandVerifier::verify: called");
        let output = run_command(&CommandSpec::new(args, workdir, self.timeout)).await;
        let text = output.render(args);
        if output.success() {
            VerifyOutcome::pass(text)
        } else {
            VerifyOutcome::fail(text)
        }
    }
}

#[derive(Default)]
pub struct VerifierRegistry {
    verifiers: BTreeMap<String, Arc<dyn Verifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `paths` and `command` verifiers
    pub fn with_builtins(command_timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PathsVerifier));
        registry.register(Arc::new(CommandVerifier::new(command_timeout)));
        registry
    }

    pub fn register(&mut self, verifier: Arc<dyn Verifier>) {
        debug!(name = verifier.name(), "VerifierRegistry::register: called");
        self.verifiers.insert(verifier.name().to_string(), verifier);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Verifier>> {
        self.verifiers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.verifiers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for VerifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifierRegistry").field("verifiers", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_paths_verifier() {
        let temp = tempdir().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/main.rs"), "fn main() {}").unwrap();

        let outcome = PathsVerifier.verify("src/*.rs", temp.path()).await;
        assert!(outcome.passed);
        assert!(outcome.output.contains("1 match"));

        let outcome = PathsVerifier.verify("src/*.rs README.md", temp.path()).await;
        assert!(!outcome.passed);
        assert!(outcome.output.contains("README.md: missing"));
    }

    #[tokio::test]
    async fn test_paths_verifier_requires_patterns() {
        let temp = tempdir().unwrap();
        assert!(!PathsVerifier.verify("  ", temp.path()).await.passed);
    }

    #[tokio::test]
    async fn test_command_verifier() {
        let temp = tempdir().unwrap();
        let verifier = CommandVerifier::new(Duration::from_secs(10));
        assert!(verifier.verify("true", temp.path()).await.passed);

        let outcome = verifier.verify("echo nope; exit 1", temp.path()).await;
        assert!(!outcome.passed);
        assert!(outcome.output.contains("nope"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = VerifierRegistry::with_builtins(Duration::from_secs(5));
        assert_eq!(registry.names(), vec!["command", "paths"]);
        assert!(registry.get("paths").is_some());
        assert!(registry.get("lint").is_none());
    }
}
