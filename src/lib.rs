//! Chart-Harvest: a resumable catalog crawler
//!
//! This crate incrementally mirrors a public chart catalog and its player
//! leaderboards into a local SQLite store. It probes the site's numeric id
//! space with pluggable exploration strategies, retries transient failures
//! with a bounded queue, checkpoints progress atomically, and collapses raw
//! player observations into stable identities across renames.

pub mod config;
pub mod crawler;
pub mod identity;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Chart-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] state::CheckpointError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Chart-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CrawlController, CrawlSummary, StopReason};
pub use identity::{IdentityResolver, Observation};
pub use state::{CancelToken, CrawlCheckpoint, ProbeOutcome, ProbeTarget};
pub use storage::{ConnectionPool, SqliteStore, WorkerId};
