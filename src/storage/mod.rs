//! Storage module for persisting the harvested catalog
//!
//! This module handles all database operations for the crawler, including:
//! - SQLite connection pooling keyed by logical worker
//! - Schema management
//! - Identity and alias persistence for the identity resolver
//! - Idempotent upserts of songs, charts and leaderboard snapshots

mod pool;
mod schema;
mod sqlite;
mod traits;

pub use pool::{ConnectionPool, PooledConnection, WorkerId};
pub use schema::SCHEMA_VERSION;
pub use sqlite::SqliteStore;
pub use traits::{CatalogStore, StorageError, StorageResult};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Formats a timestamp the way every table stores it
///
/// Fixed precision with a `Z` suffix so text comparison orders instants.
pub(crate) fn to_db_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp written by [`to_db_timestamp`]
pub(crate) fn from_db_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A player reference found on a page: display name plus the site uid when linked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRef {
    pub name: String,
    pub uid: Option<i64>,
}

/// Review status of a chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChartStatus {
    #[default]
    Alpha,
    Beta,
    Stable,
}

impl ChartStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Stable => "stable",
        }
    }

    /// Maps the badge text shown on a chart page
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "Stable" => Self::Stable,
            "Beta" => Self::Beta,
            _ => Self::Alpha,
        }
    }
}

/// Song metadata taken from a chart page
#[derive(Debug, Clone, PartialEq)]
pub struct SongRecord {
    pub sid: i64,
    pub title: String,
    pub artist: String,
    pub bpm: Option<f64>,
    pub length_secs: Option<u32>,
    pub cover_url: Option<String>,
}

/// One chart and the players credited on it
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRecord {
    pub cid: i64,
    pub sid: i64,
    pub version: String,
    pub level: Option<String>,
    pub mode: u8,
    pub status: ChartStatus,
    pub length_secs: Option<u32>,
    pub heat: u64,
    pub donate_count: u64,
    pub play_count: u64,
    pub last_updated: Option<NaiveDateTime>,
    pub creator: Option<PlayerRef>,
    pub stabilizer: Option<PlayerRef>,
}

/// The chart ids a song page lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongListing {
    pub sid: i64,
    pub title: String,
    pub chart_ids: Vec<i64>,
}

/// One entry of a mode leaderboard
#[derive(Debug, Clone, PartialEq)]
pub struct RankingRow {
    pub rank: u32,
    pub name: String,
    pub level: u32,
    pub exp: u64,
    pub accuracy: f64,
    pub combo: u64,
    pub play_count: u64,
}

/// Anything a successful probe hands to the store
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Song(SongRecord),
    Chart(ChartRecord),
    Listing(SongListing),
    Ranking { mode: u8, row: RankingRow },
}

impl Record {
    /// Natural key used for logging
    pub fn key(&self) -> String {
        match self {
            Self::Song(song) => format!("s{}", song.sid),
            Self::Chart(chart) => format!("c{}", chart.cid),
            Self::Listing(listing) => format!("s{} listing", listing.sid),
            Self::Ranking { mode, row } => format!("mode {} rank {}", mode, row.rank),
        }
    }
}

/// Identity ids resolved for the players a record mentions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordLinks {
    pub creator: Option<i64>,
    pub stabilizer: Option<i64>,
    pub player: Option<i64>,
}

/// Represents an identity in the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub id: i64,
    pub external_id: Option<String>,
    pub current_display_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Represents a historical display name of an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasRecord {
    pub id: i64,
    pub identity_id: i64,
    pub display_name: String,
    pub external_id: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Row counts for the status report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub identities: u64,
    pub aliases: u64,
    pub songs: u64,
    pub charts: u64,
    pub ranking_rows: u64,
}
