//! Status and summary reports
//!
//! This module gathers what the CLI prints: the checkpoint summary, store
//! counts, the result of a run, and a player's alias history.

use crate::config::Config;
use crate::crawler::{mode_name, CrawlSummary, SnapshotReport};
use crate::state::{CheckpointStore, CrawlCheckpoint};
use crate::storage::{
    AliasRecord, CatalogStore, ConnectionPool, IdentityRecord, SqliteStore, StoreCounts, WorkerId,
};
use crate::HarvestError;
use std::path::Path;
use std::time::Duration;

/// Everything `--status` shows
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Where the checkpoint was looked for
    pub checkpoint_path: String,

    /// The checkpoint, if one has been written
    pub checkpoint: Option<CrawlCheckpoint>,

    /// Row counts, if the database exists
    pub counts: Option<StoreCounts>,
}

/// Loads the checkpoint and store counts without starting a run
///
/// # Arguments
///
/// * `config` - The configuration naming the checkpoint and database
///
/// # Returns
///
/// * `Ok(StatusReport)` - Loaded report; missing files show up as `None`
/// * `Err(HarvestError)` - A file exists but could not be read
pub fn load_status(config: &Config) -> Result<StatusReport, HarvestError> {
    let checkpoint = CheckpointStore::new(&config.output.checkpoint_path).load()?;

    // Opening a missing database would create it
    let counts = if Path::new(&config.output.database_path).exists() {
        let pool = ConnectionPool::new(
            &config.output.database_path,
            Duration::from_millis(config.output.busy_timeout_ms),
        );
        let store = SqliteStore::for_worker(&pool, &WorkerId::new("status"))?;
        let counts = store.counts()?;
        drop(store);
        pool.release_all()?;
        Some(counts)
    } else {
        None
    };

    Ok(StatusReport {
        checkpoint_path: config.output.checkpoint_path.clone(),
        checkpoint,
        counts,
    })
}

/// Renders a status report
pub fn format_status(report: &StatusReport) -> String {
    let mut lines = vec![
        "=== Crawl Status ===".to_string(),
        String::new(),
        format!("Checkpoint: {}", report.checkpoint_path),
    ];

    match &report.checkpoint {
        Some(cp) => {
            if let Some(strategy) = cp.strategy {
                lines.push(format!("  Strategy: {}", strategy));
            }
            lines.push(format!("  Cursor: {}", cp.cursor));
            lines.push(format!("  Stored: {}", cp.total_success));
            lines.push(format!("  Absent: {}", cp.total_absent));
            lines.push(format!("  Errors: {}", cp.total_errors));
            lines.push(format!("  Given up: {}", cp.permanent_fails.len()));
            lines.push(format!("  Queued for retry: {}", cp.retry_queue.len()));
            if let Some(last_valid) = cp.strategy_state.last_valid {
                lines.push(format!("  Last valid id: {}", last_valid));
            }
            lines.push(format!("  Last save: {}", cp.last_save.to_rfc3339()));
        }
        None => lines.push("  (no checkpoint yet)".to_string()),
    }
    lines.push(String::new());

    match &report.counts {
        Some(counts) => {
            lines.push("Store:".to_string());
            lines.push(format!("  Songs: {}", counts.songs));
            lines.push(format!("  Charts: {}", counts.charts));
            lines.push(format!("  Identities: {}", counts.identities));
            lines.push(format!("  Aliases: {}", counts.aliases));
            lines.push(format!("  Ranking rows: {}", counts.ranking_rows));
        }
        None => lines.push("Store: (no database yet)".to_string()),
    }

    render(lines)
}

/// Prints a status report to stdout
pub fn print_status(report: &StatusReport) {
    print!("{}", format_status(report));
}

/// Renders the result of a crawl run
pub fn format_summary(summary: &CrawlSummary) -> String {
    let attempted = summary.total_success + summary.total_absent + summary.total_errors;
    let success_rate = if attempted > 0 {
        (summary.total_success as f64 / attempted as f64) * 100.0
    } else {
        0.0
    };
    let checkpoint = &summary.final_checkpoint;

    render(vec![
        "=== Crawl Summary ===".to_string(),
        String::new(),
        format!("Stopped: {}", summary.stop_reason),
        format!("  Stored: {}", summary.total_success),
        format!("  Absent: {}", summary.total_absent),
        format!("  Errors: {}", summary.total_errors),
        format!("  Given up: {}", checkpoint.permanent_fails.len()),
        format!("  Queued for retry: {}", checkpoint.retry_queue.len()),
        format!("  Next cursor: {}", checkpoint.cursor),
        format!("Success Rate: {:.1}%", success_rate),
    ])
}

/// Renders a leaderboard snapshot result
pub fn format_snapshot(report: &SnapshotReport, modes: &[u8]) -> String {
    let names: Vec<&str> = modes.iter().map(|&m| mode_name(m)).collect();
    let mut lines = vec![
        "=== Ranking Snapshot ===".to_string(),
        String::new(),
        format!("Modes requested: {}", names.join(", ")),
        format!("  Modes stored: {}", report.modes_stored),
        format!("  Modes failed: {}", report.modes_failed),
        format!("  Rows stored: {}", report.rows_stored),
    ];
    if report.cancelled {
        lines.push("  (cancelled before all modes ran)".to_string());
    }
    render(lines)
}

/// Renders an identity and its alias history, newest first
pub fn format_identity(identity: &IdentityRecord, aliases: &[AliasRecord]) -> String {
    let mut lines = vec![
        format!("Identity #{}", identity.id),
        format!("  Current name: {}", identity.current_display_name),
        format!(
            "  Account: {}",
            identity.external_id.as_deref().unwrap_or("(unknown)")
        ),
        format!("  First seen: {}", identity.first_seen.to_rfc3339()),
        format!("  Last seen: {}", identity.last_seen.to_rfc3339()),
        format!("  Aliases ({}):", aliases.len()),
    ];
    lines.extend(aliases.iter().map(|alias| {
        format!(
            "    - {} ({} .. {})",
            alias.display_name,
            alias.first_seen.format("%Y-%m-%d"),
            alias.last_seen.format("%Y-%m-%d")
        )
    }));
    render(lines)
}

/// Joins report lines, each newline-terminated
fn render(lines: Vec<String>) -> String {
    lines.into_iter().map(|line| line + "\n").collect()
}
