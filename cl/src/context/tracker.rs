//! Context window budget tracking
//!
//! Token counts are estimates (`chars / 4`) until the backend reports real
//! usage through [`ContextTracker::set_usage`]. Every subtraction saturates
//! so `used_tokens` never underflows.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::ContextError;
use super::filter::FileFilter;
use crate::workflow::DEFAULT_CONTEXT_LIMIT;

/// Default window size when neither config nor backend says otherwise
pub const DEFAULT_MAX_TOKENS: usize = 200_000;

/// Estimated token count of `content`
pub fn estimate_tokens(content: &str) -> usize {
    content.chars().count() / 4
}

/// Used/max tokens plus the near-limit threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextWindow {
    pub used_tokens: usize,
    pub max_tokens: usize,
    pub limit_threshold: f64,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS, DEFAULT_CONTEXT_LIMIT)
    }
}

impl ContextWindow {
    pub fn new(max_tokens: usize, limit_threshold: f64) -> Self {
        Self {
            used_tokens: 0,
            max_tokens,
            limit_threshold,
        }
    }

    /// Fraction of the window in use (0.0 when the window size is unknown)
    pub fn usage_percent(&self) -> f64 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        self.used_tokens as f64 / self.max_tokens as f64
    }

    pub fn is_near_limit(&self) -> bool {
        self.usage_percent() >= self.limit_threshold
    }
}

/// Serializable snapshot of the tracker, stored in checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextStatus {
    pub used_tokens: usize,
    pub max_tokens: usize,
    pub usage_percent: f64,
    pub limit_threshold: f64,
    pub near_limit: bool,
    pub file_count: usize,
    pub file_tokens: usize,
    pub conversation_tokens: usize,
}

#[derive(Debug, Clone)]
struct TrackedFile {
    path: PathBuf,
    content: String,
    tokens: usize,
}

/// Tracks files and conversation turns against the context window
#[derive(Debug, Clone)]
pub struct ContextTracker {
    window: ContextWindow,
    files: Vec<TrackedFile>,
    conversation_tokens: usize,
    filter: FileFilter,
}

impl ContextTracker {
    pub fn new(window: ContextWindow, filter: FileFilter) -> Self {
        debug!(max_tokens = window.max_tokens, threshold = window.limit_threshold, "ContextTracker::new: called");
        Self {
            window,
            files: Vec::new(),
            conversation_tokens: 0,
            filter,
        }
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn used_tokens(&self) -> usize {
        self.window.used_tokens
    }

    pub fn conversation_tokens(&self) -> usize {
        self.conversation_tokens
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }

    pub fn is_near_limit(&self) -> bool {
        self.window.is_near_limit()
    }

    /// Read and track a file; `Ok(false)` when the filter rejects it
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<bool, ContextError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "ContextTracker::add_file: called");
        if !self.filter.is_allowed(path) {
            info!(path = %path.display(), "Skipping context file blocked by file rules");
            return Ok(false);
        }
        let content = fs::read_to_string(path).map_err(|source| ContextError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.track_file(path, content);
        Ok(true)
    }

    /// Record already-read content for `path`
    pub(crate) fn track_file(&mut self, path: &Path, content: String) -> usize {
        let tokens = estimate_tokens(&content);
        self.window.used_tokens = self.window.used_tokens.saturating_add(tokens);
        debug!(path = %path.display(), tokens, used = self.window.used_tokens, "ContextTracker::track_file: tracked");
        self.files.push(TrackedFile {
            path: path.to_path_buf(),
            content,
            tokens,
        });
        tokens
    }

    /// Count one message toward the conversation and the window
    pub fn add_conversation_turn(&mut self, content: &str) -> usize {
        let tokens = estimate_tokens(content);
        self.conversation_tokens = self.conversation_tokens.saturating_add(tokens);
        self.window.used_tokens = self.window.used_tokens.saturating_add(tokens);
        tokens
    }

    /// Drop every tracked file, leaving conversation accounting alone
    pub fn clear_files(&mut self) {
        let file_tokens: usize = self.files.iter().map(|f| f.tokens).sum();
        debug!(files = self.files.len(), file_tokens, "ContextTracker::clear_files: called");
        self.window.used_tokens = self.window.used_tokens.saturating_sub(file_tokens);
        self.files.clear();
    }

    /// Overwrite the window with backend-reported usage
    pub fn set_usage(&mut self, used: usize, max: usize) {
        debug!(used, max, "ContextTracker::set_usage: called");
        self.window.used_tokens = used;
        if max > 0 {
            self.window.max_tokens = max;
        }
    }

    /// Take conversation totals from a stored snapshot, keeping the files tracked now
    pub fn restore_status(&mut self, status: &ContextStatus) {
        debug!(used = status.used_tokens, conversation = status.conversation_tokens, "ContextTracker::restore_status: called");
        let file_tokens: usize = self.files.iter().map(|f| f.tokens).sum();
        self.conversation_tokens = status.conversation_tokens;
        self.window.used_tokens = status
            .used_tokens
            .saturating_sub(status.file_tokens)
            .saturating_add(file_tokens);
        if status.max_tokens > 0 {
            self.window.max_tokens = status.max_tokens;
        }
    }

    pub fn status(&self) -> ContextStatus {
        ContextStatus {
            used_tokens: self.window.used_tokens,
            max_tokens: self.window.max_tokens,
            usage_percent: self.window.usage_percent(),
            limit_threshold: self.window.limit_threshold,
            near_limit: self.window.is_near_limit(),
            file_count: self.files.len(),
            file_tokens: self.files.iter().map(|f| f.tokens).sum(),
            conversation_tokens: self.conversation_tokens,
        }
    }

    /// Loaded files rendered for the first prompt of a session
    pub fn context_block(&self) -> Option<String> {
        if self.files.is_empty() {
            return None;
        }
        let mut block = String::from("# Context files\n");
        for file in &self.files {
            block.push_str(&format!("\n## {}\n\n```\n{}\n```\n", file.path.display(), file.content.trim_end()));
        }
        Some(block)
    }
}

impl Default for ContextTracker {
    fn default() -> Self {
        Self::new(ContextWindow::default(), FileFilter::allow_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FileRules;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_estimate_tokens_is_chars_div_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("héllo wörld!"), 3);
    }

    #[test]
    fn test_window_near_limit() {
        let mut window = ContextWindow::new(1000, 0.8);
        window.used_tokens = 799;
        assert!(!window.is_near_limit());
        window.used_tokens = 800;
        assert!(window.is_near_limit());
        assert_eq!(ContextWindow::new(0, 0.8).usage_percent(), 0.0);
    }

    #[test]
    fn test_add_file_and_clear() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.md");
        fs::write(&path, "x".repeat(400)).unwrap();

        let mut tracker = ContextTracker::default();
        tracker.add_conversation_turn(&"y".repeat(40));
        assert!(tracker.add_file(&path).unwrap());
        assert_eq!(tracker.used_tokens(), 110);

        tracker.clear_files();
        assert_eq!(tracker.used_tokens(), 10);
        assert_eq!(tracker.conversation_tokens(), 10);
        assert_eq!(tracker.files().count(), 0);
    }

    #[test]
    fn test_add_file_respects_filter() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("secret.key");
        fs::write(&path, "hidden").unwrap();
        let rules = FileRules {
            allow: vec![],
            deny: vec!["*.key".to_string()],
        };
        let filter = FileFilter::new(&rules, &[]).unwrap().with_root(temp.path());
        let mut tracker = ContextTracker::new(ContextWindow::default(), filter);

        assert!(!tracker.add_file(&path).unwrap());
        assert_eq!(tracker.used_tokens(), 0);
    }

    #[test]
    fn test_clear_after_set_usage_never_underflows() {
        let mut tracker = ContextTracker::default();
        tracker.track_file(Path::new("a"), "z".repeat(4000));
        tracker.set_usage(10, 50_000);
        tracker.clear_files();
        assert_eq!(tracker.used_tokens(), 0);
        assert_eq!(tracker.window().max_tokens, 50_000);
    }

    #[test]
    fn test_restore_status_keeps_current_files() {
        let mut paused = ContextTracker::default();
        paused.track_file(Path::new("old.md"), "o".repeat(400));
        paused.add_conversation_turn(&"c".repeat(80));
        paused.set_usage(5_000, 64_000);
        let snapshot = paused.status();

        let mut tracker = ContextTracker::default();
        tracker.restore_status(&snapshot);
        assert_eq!(tracker.used_tokens(), 4_900);
        assert_eq!(tracker.conversation_tokens(), 20);
        assert_eq!(tracker.window().max_tokens, 64_000);

        tracker.track_file(Path::new("old.md"), "o".repeat(400));
        assert_eq!(tracker.used_tokens(), snapshot.used_tokens);
    }

    #[test]
    fn test_context_block() {
        let mut tracker = ContextTracker::default();
        assert!(tracker.context_block().is_none());
        tracker.track_file(Path::new("src/lib.rs"), "pub fn a() {}\n".to_string());
        let block = tracker.context_block().unwrap();
        assert!(block.contains("## src/lib.rs"));
        assert!(block.contains("pub fn a() {}"));
    }

    proptest! {
        #[test]
        fn prop_clear_files_restores_usage(
            turns_before in proptest::collection::vec(".{0,200}", 0..5),
            files in proptest::collection::vec(".{0,800}", 0..8),
            turns_between in proptest::collection::vec(".{0,200}", 0..5),
        ) {
            let mut tracker = ContextTracker::default();
            for turn in &turns_before {
                tracker.add_conversation_turn(turn);
            }
            let before = tracker.used_tokens();

            let mut between = 0usize;
            for (i, content) in files.iter().enumerate() {
                tracker.track_file(Path::new(&format!("f{}", i)), content.clone());
                if let Some(turn) = turns_between.get(i) {
                    between += tracker.add_conversation_turn(turn);
                }
            }
            tracker.clear_files();

            prop_assert_eq!(tracker.used_tokens(), before + between);
            prop_assert_eq!(tracker.files().count(), 0);
        }
    }
}
