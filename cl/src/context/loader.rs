//! Resolve CONTEXT patterns to files and load them into a tracker

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::error::ContextError;
use super::tracker::ContextTracker;
use crate::workflow::ContextPatterns;

/// Files loaded and skipped by one [`ContextLoader::load`] call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub missing_optional: Vec<String>,
}

/// Glob-based context loader
///
/// Relative patterns resolve against the working directory first and then
/// against the workflow file's directory.
#[derive(Debug, Clone)]
pub struct ContextLoader {
    workdir: PathBuf,
    workflow_dir: Option<PathBuf>,
}

impl ContextLoader {
    pub fn new(workdir: impl Into<PathBuf>, workflow_dir: Option<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            workflow_dir,
        }
    }

    /// Files matching one pattern (leading `@` stripped), sorted
    pub fn resolve(&self, pattern: &str) -> Result<Vec<PathBuf>, ContextError> {
        let pattern = pattern.trim().trim_start_matches('@');
        debug!(%pattern, "ContextLoader::resolve: called");
        if Path::new(pattern).is_absolute() {
            return glob_files(pattern);
        }

        let found = glob_files(&self.workdir.join(pattern).to_string_lossy())?;
        if !found.is_empty() {
            return Ok(found);
        }
        match &self.workflow_dir {
            Some(dir) if dir != &self.workdir => glob_files(&dir.join(pattern).to_string_lossy()),
            _ => Ok(found),
        }
    }

    /// Load required and optional patterns into `tracker`
    ///
    /// Every required pattern must match; the error lists each one that did
    /// not, resolved against the working directory. Optional misses warn.
    pub fn load(&self, tracker: &mut ContextTracker, patterns: &ContextPatterns) -> Result<LoadReport, ContextError> {
        debug!(
            required = patterns.required.len(),
            optional = patterns.optional.len(),
            "ContextLoader::load: called"
        );
        let mut report = LoadReport::default();
        let mut missing = Vec::new();
        let mut files = Vec::new();

        for pattern in &patterns.required {
            let matched = self.resolve(pattern)?;
            if matched.is_empty() {
                missing.push(self.workdir.join(pattern.trim().trim_start_matches('@')));
            }
            files.extend(matched);
        }
        if !missing.is_empty() {
            return Err(ContextError::MissingContextFiles { missing });
        }

        for pattern in &patterns.optional {
            let matched = self.resolve(pattern)?;
            if matched.is_empty() {
                warn!(%pattern, "Optional context files not found");
                report.missing_optional.push(pattern.clone());
            }
            files.extend(matched);
        }

        for path in files {
            if report.loaded.contains(&path) {
                continue;
            }
            if tracker.add_file(&path)? {
                report.loaded.push(path);
            } else {
                report.skipped.push(path);
            }
        }
        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            used_tokens = tracker.used_tokens(),
            "Loaded context files"
        );
        Ok(report)
    }
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>, ContextError> {
    let entries = glob::glob(pattern).map_err(|e| ContextError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.msg.to_string(),
    })?;
    let mut files: Vec<PathBuf> = entries.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextWindow, FileFilter};
    use crate::workflow::FileRules;
    use std::fs;
    use tempfile::TempDir;

    fn patterns(required: &[&str], optional: &[&str]) -> ContextPatterns {
        ContextPatterns {
            required: required.iter().map(|s| s.to_string()).collect(),
            optional: optional.iter().map(|s| s.to_string()).collect(),
            excluded: vec![],
        }
    }

    #[test]
    fn test_loads_glob_and_strips_at() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("lib")).unwrap();
        fs::write(temp.path().join("lib/a.py"), "a = 1\n").unwrap();
        fs::write(temp.path().join("lib/b.py"), "b = 2\n").unwrap();

        let loader = ContextLoader::new(temp.path(), None);
        let mut tracker = ContextTracker::default();
        let report = loader.load(&mut tracker, &patterns(&["@lib/*.py"], &[])).unwrap();

        assert_eq!(report.loaded.len(), 2);
        assert!(report.loaded[0].ends_with("lib/a.py"));
        assert_eq!(tracker.files().count(), 2);
    }

    #[test]
    fn test_missing_required_reports_workdir_path() {
        let temp = TempDir::new().unwrap();
        let loader = ContextLoader::new(temp.path(), None);
        let mut tracker = ContextTracker::default();

        let err = loader.load(&mut tracker, &patterns(&["nope.md"], &[])).unwrap_err();

        match err {
            ContextError::MissingContextFiles { missing } => {
                assert_eq!(missing, vec![temp.path().join("nope.md")]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_optional_only_warns() {
        let temp = TempDir::new().unwrap();
        let loader = ContextLoader::new(temp.path(), None);
        let mut tracker = ContextTracker::default();

        let report = loader.load(&mut tracker, &patterns(&[], &["maybe.md"])).unwrap();
        assert_eq!(report.missing_optional, vec!["maybe.md"]);
        assert!(report.loaded.is_empty());
    }

    #[test]
    fn test_falls_back_to_workflow_dir() {
        let work = TempDir::new().unwrap();
        let flows = TempDir::new().unwrap();
        fs::write(flows.path().join("guide.md"), "guide").unwrap();

        let loader = ContextLoader::new(work.path(), Some(flows.path().to_path_buf()));
        let mut tracker = ContextTracker::default();
        let report = loader.load(&mut tracker, &patterns(&["guide.md"], &[])).unwrap();

        assert_eq!(report.loaded, vec![flows.path().join("guide.md")]);
    }

    #[test]
    fn test_allow_rules_apply_to_workflow_dir_files() {
        let work = TempDir::new().unwrap();
        let flows = TempDir::new().unwrap();
        fs::create_dir_all(flows.path().join("notes")).unwrap();
        fs::write(flows.path().join("notes/plan.md"), "plan").unwrap();

        let rules = FileRules {
            allow: vec!["notes/**".to_string()],
            deny: vec![],
        };
        let filter = FileFilter::new(&rules, &[])
            .unwrap()
            .with_root(work.path())
            .with_root(flows.path());
        let mut tracker = ContextTracker::new(ContextWindow::default(), filter);
        let loader = ContextLoader::new(work.path(), Some(flows.path().to_path_buf()));

        let report = loader.load(&mut tracker, &patterns(&["notes/*.md"], &[])).unwrap();
        assert_eq!(report.loaded, vec![flows.path().join("notes/plan.md")]);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_excluded_files_are_skipped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("keep.rs"), "fn keep() {}").unwrap();
        fs::write(temp.path().join("gen.rs"), "fn gen() {}").unwrap();

        let filter = FileFilter::new(&FileRules::default(), &["gen.rs".to_string()])
            .unwrap()
            .with_root(temp.path());
        let mut tracker = ContextTracker::new(ContextWindow::default(), filter);
        let loader = ContextLoader::new(temp.path(), None);

        let report = loader.load(&mut tracker, &patterns(&["*.rs"], &[])).unwrap();
        assert_eq!(report.loaded, vec![temp.path().join("keep.rs")]);
        assert_eq!(report.skipped, vec![temp.path().join("gen.rs")]);
    }
}
