//! Loop detector - heuristic check for runaway repetition
//!
//! Checks run in a fixed order: loop-aware phrases in the reasoning stream,
//! then a run of identical responses, then a suspiciously short response
//! after the first cycle.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Characters of a response that go into its fingerprint
const FINGERPRINT_PREFIX_CHARS: usize = 200;

static LOOP_PHRASES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(in a loop|going in circles|repeat(ed|ing) (the same|myself)|already (answered|responded|said)|same (prompt|question|request) again|seems? to be (stuck|looping))",
    )
    .expect("loop phrase regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoopDetectorConfig {
    pub enabled: bool,
    /// Fingerprints kept in the ring buffer
    pub window: usize,
    /// Consecutive identical fingerprints that count as a loop
    pub identical_threshold: usize,
    /// Responses shorter than this (after cycle 0) count as a loop
    pub min_response_length: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 10,
            identical_threshold: 3,
            min_response_length: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopReason {
    ReasoningPattern,
    IdenticalResponses,
    MinimalResponse,
}

impl fmt::Display for LoopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopReason::ReasoningPattern => "reasoning_pattern",
            LoopReason::IdenticalResponses => "identical_responses",
            LoopReason::MinimalResponse => "minimal_response",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSignal {
    pub reason: LoopReason,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    fingerprints: VecDeque<u64>,
    lengths: VecDeque<usize>,
}

fn fingerprint(response: &str) -> u64 {
    let trimmed = response.trim();
    let normalized: String = trimmed
        .to_lowercase()
        .chars()
        .take(FINGERPRINT_PREFIX_CHARS)
        .collect();
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    trimmed.chars().count().hash(&mut hasher);
    hasher.finish()
}

impl LoopDetector {
    pub fn new(mut config: LoopDetectorConfig) -> Self {
        debug!(?config, "LoopDetector::new: called");
        if config.identical_threshold > config.window {
            warn!(
                window = config.window,
                identical_threshold = config.identical_threshold,
                "Loop detection window is smaller than the identical-response threshold, widening it"
            );
            config.window = config.identical_threshold;
        }
        let window = config.window.max(1);
        Self {
            config,
            fingerprints: VecDeque::with_capacity(window),
            lengths: VecDeque::with_capacity(window),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record a response and report a loop if one is detected
    pub fn check(&mut self, reasoning: Option<&str>, response: &str, cycle_number: u32) -> Option<LoopSignal> {
        if !self.config.enabled {
            return None;
        }
        debug!(response_len = response.len(), cycle_number, "LoopDetector::check: called");

        let window = self.config.window.max(1);
        if self.fingerprints.len() == window {
            self.fingerprints.pop_front();
            self.lengths.pop_front();
        }
        self.fingerprints.push_back(fingerprint(response));
        self.lengths.push_back(response.chars().count());

        if let Some(found) = reasoning.and_then(|r| LOOP_PHRASES.find(r)) {
            return Some(self.signal(LoopReason::ReasoningPattern, format!("reasoning says '{}'", found.as_str())));
        }

        let threshold = self.config.identical_threshold;
        if threshold > 0 && self.fingerprints.len() >= threshold {
            let mut recent = self.fingerprints.iter().rev().take(threshold);
            let first = recent.next();
            if recent.all(|fp| Some(fp) == first) {
                return Some(self.signal(
                    LoopReason::IdenticalResponses,
                    format!("last {} responses were identical", threshold),
                ));
            }
        }

        let length = response.chars().count();
        if cycle_number > 0 && length < self.config.min_response_length {
            return Some(self.signal(
                LoopReason::MinimalResponse,
                format!(
                    "response of {} chars is below the minimum of {}",
                    length, self.config.min_response_length
                ),
            ));
        }
        None
    }

    fn signal(&self, reason: LoopReason, detail: String) -> LoopSignal {
        warn!(%reason, %detail, "Loop detected");
        LoopSignal { reason, detail }
    }

    pub fn reset(&mut self) {
        self.fingerprints.clear();
        self.lengths.clear();
    }

    /// Lengths of the responses currently in the window
    pub fn recent_lengths(&self) -> impl Iterator<Item = usize> + '_ {
        self.lengths.iter().copied()
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(LoopDetectorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(text: &str) -> String {
        format!("{} {}", text, "detail ".repeat(30))
    }

    #[test]
    fn test_identical_responses_trigger_on_threshold() {
        let mut detector = LoopDetector::default();
        let response = long("same answer");

        assert_eq!(detector.check(None, &response, 0), None);
        assert_eq!(detector.check(None, &response, 0), None);
        let signal = detector.check(None, &response, 0).unwrap();
        assert_eq!(signal.reason, LoopReason::IdenticalResponses);
    }

    #[test]
    fn test_window_widened_to_threshold() {
        let mut detector = LoopDetector::new(LoopDetectorConfig {
            window: 2,
            identical_threshold: 4,
            ..Default::default()
        });
        let response = long("same answer");

        for _ in 0..3 {
            assert_eq!(detector.check(None, &response, 0), None);
        }
        let signal = detector.check(None, &response, 0).unwrap();
        assert_eq!(signal.reason, LoopReason::IdenticalResponses);
        assert_eq!(detector.recent_lengths().count(), 4);
    }

    #[test]
    fn test_varied_responses_do_not_trigger() {
        let mut detector = LoopDetector::default();
        for i in 0..12 {
            assert_eq!(detector.check(None, &long(&format!("answer {}", i)), 0), None);
        }
        assert_eq!(detector.recent_lengths().count(), 10);
    }

    #[test]
    fn test_minimal_response_only_after_first_cycle() {
        let mut detector = LoopDetector::default();
        assert_eq!(detector.check(None, "ok", 0), None);

        let mut detector = LoopDetector::default();
        let signal = detector.check(None, "ok", 1).unwrap();
        assert_eq!(signal.reason, LoopReason::MinimalResponse);
    }

    #[test]
    fn test_reasoning_pattern_checked_first() {
        let mut detector = LoopDetector::default();
        let signal = detector
            .check(Some("Hmm, I seem to be stuck on this"), "ok", 1)
            .unwrap();
        assert_eq!(signal.reason, LoopReason::ReasoningPattern);
        assert!(signal.detail.contains("seem to be stuck"));
    }

    #[test]
    fn test_fingerprint_ignores_case_and_whitespace() {
        assert_eq!(fingerprint("  Hello World \n"), fingerprint("hello world"));
        assert_eq!(fingerprint("Hello"), fingerprint("hello"));
        assert_ne!(fingerprint("hello"), fingerprint("hello!"));
    }

    #[test]
    fn test_disabled_detector() {
        let mut detector = LoopDetector::new(LoopDetectorConfig {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(detector.check(Some("I am in a loop"), "", 5), None);
    }
}
