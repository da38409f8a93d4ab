//! Compaction policy and session modes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::tracker::{ContextTracker, ContextWindow};

/// Summary instruction used when the workflow sets no COMPACT-SUMMARY
pub const DEFAULT_SUMMARY_INSTRUCTION: &str =
    "Summarize the conversation so far so the work can continue from the summary alone. \
     Keep every decision made and the files being worked on.";

/// How the backend session is managed between cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Keep one session; compact only when the window fills up
    #[default]
    Accumulate,
    /// Compact once per cycle after the first
    Compact,
    /// New session and reloaded context every cycle after the first
    Fresh,
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "accumulate" => Ok(SessionMode::Accumulate),
            "compact" => Ok(SessionMode::Compact),
            "fresh" => Ok(SessionMode::Fresh),
            other => Err(format!(
                "unknown mode '{}', expected one of: accumulate, compact, fresh",
                other
            )),
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionMode::Accumulate => "accumulate",
            SessionMode::Compact => "compact",
            SessionMode::Fresh => "fresh",
        };
        f.write_str(name)
    }
}

/// What a session mode asks for before a cycle starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCycleAction {
    None,
    Compact,
    FreshSession,
}

impl SessionMode {
    pub fn pre_cycle_action(&self, cycle_number: u32) -> PreCycleAction {
        if cycle_number == 0 {
            return PreCycleAction::None;
        }
        match self {
            SessionMode::Accumulate => PreCycleAction::None,
            SessionMode::Compact => PreCycleAction::Compact,
            SessionMode::Fresh => PreCycleAction::FreshSession,
        }
    }
}

fn normalize_density(min_density: f64) -> f64 {
    if min_density > 1.0 { min_density / 100.0 } else { min_density }
}

impl ContextWindow {
    /// Whether automatic compaction should run
    ///
    /// `min_density` above 1 is read as a percentage. Usage below it never
    /// compacts; above it the near-limit threshold decides.
    pub fn needs_compaction(&self, min_density: Option<f64>) -> bool {
        let usage = self.usage_percent();
        if let Some(min) = min_density.map(normalize_density)
            && usage < min
        {
            debug!(usage, min, "needs_compaction: below minimum density");
            return false;
        }
        self.is_near_limit()
    }
}

impl ContextTracker {
    pub fn needs_compaction(&self, min_density: Option<f64>) -> bool {
        self.window().needs_compaction(min_density)
    }
}

/// Instruction sent to the backend when compacting
pub fn compaction_prompt(preserve: &[String], summary: Option<&str>) -> String {
    let mut prompt = String::from(summary.unwrap_or(DEFAULT_SUMMARY_INSTRUCTION).trim());
    if !preserve.is_empty() {
        prompt.push_str("\n\nPreserve the following exactly:\n");
        for item in preserve {
            prompt.push_str("- ");
            prompt.push_str(item);
            prompt.push('\n');
        }
    }
    prompt
}
