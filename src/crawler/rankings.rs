//! Leaderboard snapshots
//!
//! A snapshot walks the per-mode leaderboards once. Each mode is its own unit
//! of work, so a failing mode never takes the others down with it. Modes are
//! not retried; the next snapshot picks them up.

use crate::crawler::fetcher::MalodySource;
use crate::crawler::parser::parse_player_list;
use crate::crawler::persist::persist_unit;
use crate::crawler::rate_limit::RateLimiter;
use crate::state::CancelToken;
use crate::storage::{CatalogStore, Record};
use chrono::Utc;

/// Game modes the site ranks players in, by mode number
pub const MODE_NAMES: [&str; 10] = [
    "Key", "Step", "DJ", "Catch", "Pad", "Taiko", "Ring", "Slide", "Live", "Cube",
];

/// Display name of a mode number
pub fn mode_name(mode: u8) -> &'static str {
    MODE_NAMES.get(usize::from(mode)).copied().unwrap_or("Unknown")
}

/// Every mode, in order
pub fn all_modes() -> Vec<u8> {
    (0..MODE_NAMES.len() as u8).collect()
}

/// Per-mode result counts of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    pub modes_stored: usize,
    pub rows_stored: usize,
    pub modes_failed: usize,
    pub cancelled: bool,
}

/// Takes one leaderboard snapshot across `modes`
///
/// # Arguments
///
/// * `source` - HTTP source for the site
/// * `store` - The catalog store
/// * `limiter` - Paces every leaderboard request
/// * `cancel` - Checked before each mode
/// * `modes` - Mode numbers to snapshot
///
/// # Returns
///
/// Counts of stored and failed modes
pub async fn take_ranking_snapshot<S: CatalogStore>(
    source: &MalodySource,
    store: &mut S,
    limiter: &RateLimiter,
    cancel: &CancelToken,
    modes: &[u8],
) -> SnapshotReport {
    let mut report = SnapshotReport::default();

    for &mode in modes {
        if cancel.is_cancelled() {
            tracing::info!("Cancellation requested, stopping snapshot");
            report.cancelled = true;
            break;
        }

        limiter.wait().await;

        let html = match source.fetch_leaderboard(mode).await {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!("Leaderboard for {} unavailable: {}", mode_name(mode), e);
                report.modes_failed += 1;
                continue;
            }
        };

        let rows = match parse_player_list(&html) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Could not parse {} leaderboard: {}", mode_name(mode), e);
                report.modes_failed += 1;
                continue;
            }
        };

        let records: Vec<Record> = rows
            .into_iter()
            .map(|row| Record::Ranking { mode, row })
            .collect();

        match persist_unit(store, &records, Utc::now()) {
            Ok(written) => {
                tracing::info!("Stored {} {} leaderboard rows", written, mode_name(mode));
                report.modes_stored += 1;
                report.rows_stored += written;
            }
            Err(e) => {
                tracing::warn!("Storing {} leaderboard failed: {}", mode_name(mode), e);
                report.modes_failed += 1;
            }
        }
    }

    report
}
