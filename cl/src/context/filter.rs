//! Allow/deny predicate for file access

use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::debug;

use super::error::ContextError;
use crate::workflow::FileRules;

/// Compiled allow/deny globs
///
/// Deny always wins. With no allow patterns every non-denied path passes.
/// Paths under a root are matched relative to each root they sit under.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
    roots: Vec<PathBuf>,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, ContextError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p.trim_start_matches('@')).map_err(|e| ContextError::InvalidPattern {
                pattern: p.clone(),
                reason: e.msg.to_string(),
            })
        })
        .collect()
}

impl FileFilter {
    /// Filter from workflow rules, treating `excluded` as extra deny patterns
    pub fn new(rules: &FileRules, excluded: &[String]) -> Result<Self, ContextError> {
        debug!(allow = rules.allow.len(), deny = rules.deny.len(), excluded = excluded.len(), "FileFilter::new: called");
        let mut deny = compile(&rules.deny)?;
        deny.extend(compile(excluded)?);
        Ok(Self {
            allow: compile(&rules.allow)?,
            deny,
            roots: Vec::new(),
        })
    }

    /// Filter that allows everything
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Add a base directory that patterns are relative to
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if !self.roots.contains(&root) {
            self.roots.push(root);
        }
        self
    }

    /// Forms of `path` to match: relative to each root it is under, else as given
    fn candidates<'a>(&self, path: &'a Path) -> Vec<&'a Path> {
        let relative: Vec<&Path> = self.roots.iter().filter_map(|root| path.strip_prefix(root).ok()).collect();
        if relative.is_empty() {
            vec![path]
        } else {
            relative
        }
    }

    pub fn is_allowed(&self, path: &Path) -> bool {
        let candidates = self.candidates(path);
        let matches = |patterns: &[Pattern]| candidates.iter().any(|c| patterns.iter().any(|p| p.matches_path(c)));

        if matches(&self.deny) {
            debug!(path = %path.display(), "FileFilter::is_allowed: denied");
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        let allowed = matches(&self.allow);
        if !allowed {
            debug!(path = %path.display(), "FileFilter::is_allowed: not in allow list");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(allow: &[&str], deny: &[&str]) -> FileRules {
        FileRules {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_no_rules_allow_everything() {
        let filter = FileFilter::new(&FileRules::default(), &[]).unwrap();
        assert!(filter.is_allowed(Path::new("anything/at/all.txt")));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let filter = FileFilter::new(&rules(&["src/**"], &["src/secret/**"]), &[]).unwrap();
        assert!(filter.is_allowed(Path::new("src/main.rs")));
        assert!(!filter.is_allowed(Path::new("src/secret/key.pem")));
        assert!(!filter.is_allowed(Path::new("docs/readme.md")));
    }

    #[test]
    fn test_excluded_patterns_deny() {
        let filter = FileFilter::new(&FileRules::default(), &["*.lock".to_string()]).unwrap();
        assert!(!filter.is_allowed(Path::new("Cargo.lock")));
        assert!(filter.is_allowed(Path::new("Cargo.toml")));
    }

    #[test]
    fn test_root_relative_matching() {
        let filter = FileFilter::new(&rules(&["src/**"], &[]), &[])
            .unwrap()
            .with_root("/work/project");
        assert!(filter.is_allowed(Path::new("/work/project/src/lib.rs")));
        assert!(!filter.is_allowed(Path::new("/work/project/tests/a.rs")));
    }

    #[test]
    fn test_matches_relative_to_any_root() {
        let filter = FileFilter::new(&rules(&["notes/**"], &["notes/private/**"]), &[])
            .unwrap()
            .with_root("/work/project")
            .with_root("/work/flows");
        assert!(filter.is_allowed(Path::new("/work/flows/notes/plan.md")));
        assert!(filter.is_allowed(Path::new("/work/project/notes/todo.md")));
        assert!(!filter.is_allowed(Path::new("/work/flows/notes/private/key.md")));
        assert!(!filter.is_allowed(Path::new("/work/flows/src/lib.rs")));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = FileFilter::new(&rules(&["src/[", ""], &[]), &[]).unwrap_err();
        assert!(matches!(err, ContextError::InvalidPattern { .. }));
    }
}
