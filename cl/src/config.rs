//! convoloop configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::BackendConfig;
use crate::context::DEFAULT_MAX_TOKENS;
use crate::detector::LoopDetectorConfig;
use crate::engine::{DEFAULT_CHECKPOINT_DIR, EngineOptions};

/// Main convoloop configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Log level used when `--log-level` is not given
    pub log_level: Option<String>,

    /// Default adapter and per-adapter settings
    pub backend: BackendConfig,

    /// Context window settings
    pub context: ContextConfig,

    /// Where session checkpoint directories are created
    pub checkpoints: CheckpointsConfig,

    /// Repetition and stall detection
    pub loop_detection: LoopDetectorConfig,

    /// Limits for `apply`
    pub concurrency: ConcurrencyConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .convoloop.yml
        let local_config = PathBuf::from(".convoloop.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/convoloop/convoloop.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("convoloop").join("convoloop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Engine options for a run rooted at `workdir`
    pub fn engine_options(&self, workdir: impl Into<PathBuf>) -> EngineOptions {
        EngineOptions {
            workdir: workdir.into(),
            checkpoint_dir: self.checkpoints.dir.clone(),
            max_tokens: self.context.max_tokens,
            loop_detection: self.loop_detection.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ContextConfig {
    /// Context window size when the backend does not report one
    pub max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CheckpointsConfig {
    pub dir: PathBuf,
}

impl Default for CheckpointsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
        }
    }
}

/// Concurrency limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConcurrencyConfig {
    /// Maximum components run at once by `apply`
    pub max_parallel: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_parallel: 4 }
    }
}
