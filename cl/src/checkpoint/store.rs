//! CheckpointStore - one directory per session
//!
//! Layout:
//! ```text
//! <session-dir>/
//!   pause.json                 singleton, overwritten on every pause
//!   <name>-<id8>.json          named checkpoints, created once
//! ```

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::record::{Checkpoint, PAUSE_RECORD_TYPE, PauseRecord};

pub const PAUSE_FILE: &str = "pause.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid checkpoint JSON at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No pause checkpoint at {0}")]
    NoPause(PathBuf),

    #[error("{path} is not a pause record (type '{found}')")]
    NotPauseRecord { path: PathBuf, found: String },
}

/// Filesystem-safe version of a checkpoint name
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "checkpoint".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "CheckpointStore::new: called");
        Self { dir }
    }

    /// Store for `session_id` under a base checkpoint directory
    pub fn for_session(base: impl AsRef<Path>, session_id: &str) -> Self {
        Self::new(base.as_ref().join(session_id))
    }

    /// Store for an explicit location: a session directory or a pause file
    pub fn at(location: impl AsRef<Path>) -> Self {
        let location = location.as_ref();
        if location.is_file() {
            Self::new(location.parent().unwrap_or_else(|| Path::new(".")))
        } else {
            Self::new(location)
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pause_path(&self) -> PathBuf {
        self.dir.join(PAUSE_FILE)
    }

    fn ensure_dir(&self) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    /// Write a named checkpoint; existing files are never replaced
    pub fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        debug!(name = %checkpoint.name, id = %checkpoint.id, "CheckpointStore::create_checkpoint: called");
        self.ensure_dir()?;
        let id = checkpoint.id.simple().to_string();
        let stem = format!("{}-{}", sanitize_name(&checkpoint.name), &id[id.len() - 8..]);
        let bytes = to_json(checkpoint, &self.dir)?;

        let mut suffix = 0u32;
        loop {
            let file_name = if suffix == 0 {
                format!("{}.json", stem)
            } else {
                format!("{}-{}.json", stem, suffix)
            };
            let path = self.dir.join(file_name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&bytes).map_err(|source| CheckpointError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    info!(name = %checkpoint.name, path = %path.display(), "Checkpoint written");
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(path = %path.display(), "create_checkpoint: name taken, trying next");
                    suffix += 1;
                }
                Err(source) => return Err(CheckpointError::Io { path, source }),
            }
        }
    }

    /// Overwrite the pause record atomically (temp file then rename)
    pub fn save_pause(&self, record: &PauseRecord) -> Result<PathBuf, CheckpointError> {
        debug!(session_id = %record.session_id, status = %record.status, reason = %record.reason, "CheckpointStore::save_pause: called");
        self.ensure_dir()?;
        let path = self.pause_path();
        let tmp = self.dir.join(format!("{}.tmp", PAUSE_FILE));
        let bytes = to_json(record, &path)?;
        fs::write(&tmp, bytes).map_err(|source| CheckpointError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), message = %record.message, "Pause checkpoint saved");
        Ok(path)
    }

    /// Pause record, or `None` if this session is not paused
    pub fn read_pause(&self) -> Result<Option<PauseRecord>, CheckpointError> {
        let path = self.pause_path();
        if !path.exists() {
            return Ok(None);
        }
        let record: PauseRecord = read_json(&path)?;
        if record.record_type != PAUSE_RECORD_TYPE {
            return Err(CheckpointError::NotPauseRecord {
                path,
                found: record.record_type,
            });
        }
        Ok(Some(record))
    }

    /// Pause record that must exist
    pub fn require_pause(&self) -> Result<PauseRecord, CheckpointError> {
        self.read_pause()?.ok_or_else(|| CheckpointError::NoPause(self.pause_path()))
    }

    /// Remove the pause record; `Ok(false)` if there was none
    pub fn delete_pause(&self) -> Result<bool, CheckpointError> {
        let path = self.pause_path();
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Pause checkpoint deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    pub fn read_checkpoint(&self, path: impl AsRef<Path>) -> Result<Checkpoint, CheckpointError> {
        read_json(path.as_ref())
    }

    /// Named checkpoints ordered by timestamp; unreadable files are skipped
    pub fn list_checkpoints(&self) -> Result<Vec<(PathBuf, Checkpoint)>, CheckpointError> {
        debug!(dir = %self.dir.display(), "CheckpointStore::list_checkpoints: called");
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut checkpoints = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_json = path.extension().is_some_and(|ext| ext == "json");
            if !is_json || path.file_name().is_some_and(|n| n == PAUSE_FILE) {
                continue;
            }
            match read_json::<Checkpoint>(&path) {
                Ok(checkpoint) => checkpoints.push((path, checkpoint)),
                Err(e) => warn!(error = %e, "Skipping unreadable checkpoint"),
            }
        }
        checkpoints.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp));
        Ok(checkpoints)
    }
}

fn to_json<T: Serialize>(value: &T, path: &Path) -> Result<Vec<u8>, CheckpointError> {
    serde_json::to_vec_pretty(value).map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let text = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CheckpointError::Json {
        path: path.to_path_buf(),
        source,
    })
}
