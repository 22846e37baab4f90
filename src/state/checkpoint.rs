//! Crawl checkpoint persistence
//!
//! A checkpoint is a small JSON document describing how far an exploration
//! run got: the strategy cursor, success/error counters, the ids that were
//! given up on, and the ids still waiting for a retry. It is written with a
//! temp-file-then-rename so a crash mid-save never leaves a truncated file.

use crate::config::StrategyKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Current on-disk checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Errors raised while reading or writing a checkpoint
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed checkpoint JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid checkpoint: {0}")]
    Invalid(String),
}

/// One queued retry, serialized as `[id, attempts]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry(pub i64, pub u32);

impl RetryEntry {
    pub fn id(&self) -> i64 {
        self.0
    }

    pub fn attempts(&self) -> u32 {
        self.1
    }
}

/// Strategy-specific progress beyond the plain cursor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyState {
    /// Last song id that was found (backward probe)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_valid: Option<i64>,

    /// Length of the current run of absent ids (backward probe)
    #[serde(default)]
    pub consecutive_not_found: u32,

    /// Song whose charts are being expanded (song expand)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_song: Option<i64>,

    /// Charts discovered on `current_song` that have not been probed yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_charts: Vec<i64>,

    /// Songs that listed no charts; never probed again
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub empty_songs: BTreeSet<i64>,

    /// Songs whose page kept failing past the retry cap
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub failed_songs: BTreeSet<i64>,

    /// Failures so far on the song page at the cursor (song expand)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub song_failures: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl StrategyState {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Durable snapshot of an exploration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlCheckpoint {
    /// Next identifier to probe (meaning depends on the strategy)
    pub cursor: i64,
    pub total_success: u64,
    pub total_errors: u64,
    pub permanent_fails: BTreeSet<i64>,
    pub retry_queue: Vec<RetryEntry>,
    pub last_save: DateTime<Utc>,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,

    #[serde(default)]
    pub total_absent: u64,

    #[serde(default, skip_serializing_if = "StrategyState::is_empty")]
    pub strategy_state: StrategyState,
}

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

impl CrawlCheckpoint {
    /// Creates an empty checkpoint positioned at `cursor`
    pub fn fresh(strategy: StrategyKind, cursor: i64) -> Self {
        Self {
            cursor,
            total_success: 0,
            total_errors: 0,
            permanent_fails: BTreeSet::new(),
            retry_queue: Vec::new(),
            last_save: Utc::now(),
            version: CHECKPOINT_VERSION,
            strategy: Some(strategy),
            config_hash: None,
            total_absent: 0,
            strategy_state: StrategyState::default(),
        }
    }

    /// Checks the structural invariants of a loaded checkpoint
    ///
    /// * version must be known to this build
    /// * no retry entry may exceed `max_retries` attempts
    /// * no id may be both queued and permanently failed
    pub fn validate(&self, max_retries: u32) -> Result<(), CheckpointError> {
        if self.version > CHECKPOINT_VERSION || self.version == 0 {
            return Err(CheckpointError::UnsupportedVersion(self.version));
        }

        let mut queued = BTreeSet::new();
        for entry in &self.retry_queue {
            if entry.attempts() > max_retries {
                return Err(CheckpointError::Invalid(format!(
                    "retry entry {} has {} attempts, cap is {}",
                    entry.id(),
                    entry.attempts(),
                    max_retries
                )));
            }
            if self.permanent_fails.contains(&entry.id()) {
                return Err(CheckpointError::Invalid(format!(
                    "id {} is both queued for retry and permanently failed",
                    entry.id()
                )));
            }
            if !queued.insert(entry.id()) {
                return Err(CheckpointError::Invalid(format!(
                    "id {} is queued for retry twice",
                    entry.id()
                )));
            }
        }

        Ok(())
    }
}

/// Loads and atomically saves a checkpoint file
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the checkpoint, returning `None` if no file exists yet
    pub fn load(&self) -> Result<Option<CrawlCheckpoint>, CheckpointError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)?;
        let checkpoint: CrawlCheckpoint = serde_json::from_str(&content)?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(checkpoint.version));
        }

        Ok(Some(checkpoint))
    }

    /// Stamps `last_save` and writes the checkpoint via temp file + rename
    pub fn save(&self, checkpoint: &mut CrawlCheckpoint) -> Result<(), CheckpointError> {
        checkpoint.last_save = Utc::now();
        checkpoint.version = CHECKPOINT_VERSION;

        let json = serde_json::to_string_pretty(checkpoint)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| CheckpointError::Io(e.error))?;

        tracing::trace!("Checkpoint written to {}", self.path.display());
        Ok(())
    }
}
