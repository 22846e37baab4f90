use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Main configuration structure for Chart-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    pub site: SiteConfig,
    pub output: OutputConfig,
}

/// Which exploration policy drives a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Walk chart ids upward from `start-id`
    ForwardId,

    /// Walk song ids upward, probing every chart each song lists
    SongExpand,

    /// Walk song ids until a long run of absent ids marks the end of the space
    BackwardSongProbe,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForwardId => "forward-id",
            Self::SongExpand => "song-expand",
            Self::BackwardSongProbe => "backward-song-probe",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward-id" => Ok(Self::ForwardId),
            "song-expand" => Ok(Self::SongExpand),
            "backward-song-probe" => Ok(Self::BackwardSongProbe),
            other => Err(format!(
                "unknown strategy '{}' (expected forward-id, song-expand or backward-song-probe)",
                other
            )),
        }
    }
}

/// Crawl behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Exploration strategy
    pub strategy: StrategyKind,

    /// First identifier to probe
    #[serde(rename = "start-id")]
    pub start_id: i64,

    /// Last identifier to probe (inclusive); unbounded if absent
    #[serde(rename = "end-id", default)]
    pub end_id: Option<i64>,

    /// Target request rate against the site
    #[serde(rename = "requests-per-minute")]
    pub requests_per_minute: f64,

    /// Relative jitter applied to every delay, in [0, 1]
    #[serde(rename = "jitter-factor", default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Retries granted to a transiently failing id before it is given up on
    #[serde(rename = "max-retries", default = "default_max_retries")]
    pub max_retries: u32,

    /// Absent ids in a row that end a backward song probe
    #[serde(
        rename = "max-consecutive-not-found",
        default = "default_max_consecutive_not_found"
    )]
    pub max_consecutive_not_found: u32,

    /// Drain the retry queue every N probes
    #[serde(rename = "drain-every", default = "default_drain_every")]
    pub drain_every: u32,

    /// Drain the retry queue eagerly after this many transient failures in a row
    #[serde(rename = "failure-streak-drain", default = "default_failure_streak_drain")]
    pub failure_streak_drain: u32,

    /// Persist the checkpoint every N iterations (and whenever the retry queue changes)
    #[serde(rename = "checkpoint-every", default = "default_checkpoint_every")]
    pub checkpoint_every: u32,

    /// Continue from an existing checkpoint instead of starting over
    #[serde(default = "default_resume")]
    pub resume: bool,
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_consecutive_not_found() -> u32 {
    10
}

fn default_drain_every() -> u32 {
    50
}

fn default_failure_streak_drain() -> u32 {
    5
}

fn default_checkpoint_every() -> u32 {
    10
}

fn default_resume() -> bool {
    true
}

/// Remote site configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Root URL of the catalog site
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// User agent sent with every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,

    /// Raw `Cookie` header value for an authenticated session
    #[serde(default)]
    pub cookie: Option<String>,

    /// Per-request timeout in seconds
    #[serde(rename = "timeout-secs", default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Path to the JSON checkpoint file
    #[serde(rename = "checkpoint-path")]
    pub checkpoint_path: String,

    /// How long a connection waits on a locked database (milliseconds)
    #[serde(rename = "busy-timeout-ms", default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    3000
}
