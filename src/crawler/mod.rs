//! Crawler module for probing the catalog and storing what it finds
//!
//! This module contains the core crawling logic, including:
//! - HTTP fetching and response classification
//! - HTML parsing of chart, song and leaderboard pages
//! - Exploration strategies, rate limiting and the retry queue
//! - Overall crawl control and leaderboard snapshots

mod controller;
mod fetcher;
mod parser;
mod persist;
mod rankings;
mod rate_limit;
mod retry;
mod source;
mod strategy;

pub use controller::{CrawlController, CrawlSummary, StopReason};
pub use fetcher::{build_http_client, classify_status, MalodySource};
pub use parser::{parse_chart_page, parse_player_list, parse_song_page, ParseError};
pub use persist::persist_unit;
pub use rankings::{all_modes, mode_name, take_ranking_snapshot, SnapshotReport, MODE_NAMES};
pub use rate_limit::RateLimiter;
pub use retry::{RetryDecision, RetryDrain, RetryQueue};
pub use source::{FetchError, ProbeSource};
pub use strategy::{
    build_strategy, BackwardSongProbe, DoneReason, ExplorationStrategy, ForwardId, Ledger,
    SongExpand, Step,
};

use crate::config::Config;
use crate::state::CancelToken;
use crate::storage::{ConnectionPool, SqliteStore, WorkerId};
use crate::HarvestError;
use std::time::Duration;

/// Worker name the crawl run registers with the connection pool
pub const CRAWL_WORKER: &str = "crawler";

/// Runs a complete crawl against the live site
///
/// This is the main entry point for starting a crawl. It will:
/// 1. Open the store through a connection pool
/// 2. Build the HTTP source
/// 3. Resume from the checkpoint (unless `resume` is off)
/// 4. Probe until the strategy finishes or `cancel` fires
///
/// # Arguments
///
/// * `config` - The validated configuration
/// * `config_hash` - Fingerprint of the config file, stored in checkpoints
/// * `cancel` - Stops the run at its next loop boundary
///
/// # Returns
///
/// * `Ok(CrawlSummary)` - Run finished or was cancelled cleanly
/// * `Err(HarvestError)` - Startup failed or a checkpoint could not be written
pub async fn crawl(
    config: &Config,
    config_hash: Option<String>,
    cancel: CancelToken,
) -> Result<CrawlSummary, HarvestError> {
    let pool = ConnectionPool::new(
        &config.output.database_path,
        Duration::from_millis(config.output.busy_timeout_ms),
    );
    let store = SqliteStore::for_worker(&pool, &WorkerId::new(CRAWL_WORKER))?;
    let source = MalodySource::new(&config.site)?;

    let mut controller = CrawlController::new(config, source, store)?.with_cancel_token(cancel);
    if let Some(hash) = config_hash {
        controller = controller.with_config_hash(hash);
    }

    let summary = controller.run().await;
    drop(controller);
    pool.release_all()?;
    summary
}

/// Takes one leaderboard snapshot against the live site
pub async fn snapshot_rankings(
    config: &Config,
    modes: &[u8],
    cancel: CancelToken,
) -> Result<SnapshotReport, HarvestError> {
    let pool = ConnectionPool::new(
        &config.output.database_path,
        Duration::from_millis(config.output.busy_timeout_ms),
    );
    let mut store = SqliteStore::for_worker(&pool, &WorkerId::new("rankings"))?;
    let source = MalodySource::new(&config.site)?;
    let limiter = RateLimiter::from_config(&config.crawler);

    let report = take_ranking_snapshot(&source, &mut store, &limiter, &cancel, modes).await;
    drop(store);
    pool.release_all()?;
    Ok(report)
}
