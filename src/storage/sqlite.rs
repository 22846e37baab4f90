//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the CatalogStore trait.

use crate::storage::pool::{ConnectionPool, PooledConnection, WorkerId};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{CatalogStore, StorageError, StorageResult};
use crate::storage::{
    from_db_timestamp, to_db_timestamp, AliasRecord, ChartRecord, IdentityRecord, Record,
    RecordLinks, SongListing, SongRecord, StoreCounts,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

/// SQLite catalog store bound to one pooled connection
pub struct SqliteStore {
    conn: PooledConnection,
}

impl SqliteStore {
    /// Wraps an already configured connection handle
    pub fn new(conn: PooledConnection) -> Self {
        Self { conn }
    }

    /// Opens the store for `worker` through the pool
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStore)` - Store bound to the worker's connection
    /// * `Err(StorageError::StoreUnavailable)` - The database could not be opened
    pub fn for_worker(pool: &ConnectionPool, worker: &WorkerId) -> StorageResult<Self> {
        Ok(Self::new(pool.acquire(worker)?))
    }

    /// Creates an in-memory database (for tests and dry runs)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self::new(Arc::new(Mutex::new(conn))))
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> StorageResult<T> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(f(&conn)?)
    }
}

fn savepoint_name(name: &str) -> StorageResult<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StorageError::Database(format!(
            "invalid savepoint name '{}'",
            name
        )))
    }
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    from_db_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad timestamp '{}'", raw).into(),
        )
    })
}

fn identity_from_row(row: &Row<'_>) -> Result<IdentityRecord, rusqlite::Error> {
    Ok(IdentityRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        current_display_name: row.get(2)?,
        first_seen: timestamp_column(row, 3)?,
        last_seen: timestamp_column(row, 4)?,
    })
}

fn alias_from_row(row: &Row<'_>) -> Result<AliasRecord, rusqlite::Error> {
    Ok(AliasRecord {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        display_name: row.get(2)?,
        external_id: row.get(3)?,
        first_seen: timestamp_column(row, 4)?,
        last_seen: timestamp_column(row, 5)?,
    })
}

const IDENTITY_COLUMNS: &str = "id, external_id, current_display_name, first_seen, last_seen";
const ALIAS_COLUMNS: &str = "id, identity_id, display_name, external_id, first_seen, last_seen";

fn upsert_song(conn: &Connection, song: &SongRecord, at: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO songs (sid, title, artist, bpm, length, cover_url, crawled_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(sid) DO UPDATE SET
            title = excluded.title,
            artist = excluded.artist,
            bpm = COALESCE(excluded.bpm, songs.bpm),
            length = COALESCE(excluded.length, songs.length),
            cover_url = COALESCE(excluded.cover_url, songs.cover_url),
            crawled_at = excluded.crawled_at",
        params![
            song.sid,
            song.title,
            song.artist,
            song.bpm,
            song.length_secs,
            song.cover_url,
            at
        ],
    )?;
    Ok(())
}

fn upsert_listing(
    conn: &Connection,
    listing: &SongListing,
    at: &str,
) -> Result<(), rusqlite::Error> {
    // A listing only knows the title; keep richer metadata from chart pages
    conn.execute(
        "INSERT INTO songs (sid, title, crawled_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(sid) DO UPDATE SET
            title = CASE WHEN excluded.title <> '' THEN excluded.title ELSE songs.title END,
            crawled_at = excluded.crawled_at",
        params![listing.sid, listing.title, at],
    )?;
    Ok(())
}

fn upsert_chart(
    conn: &Connection,
    chart: &ChartRecord,
    links: &RecordLinks,
    at: &str,
) -> Result<(), rusqlite::Error> {
    let last_updated = chart
        .last_updated
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string());

    conn.execute(
        "INSERT INTO charts (cid, sid, version, level, mode, status, length, heat,
             donate_count, play_count, last_updated, creator_identity_id, creator_uid,
             creator_name, stabilizer_identity_id, stabilizer_uid, stabilizer_name, crawled_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(cid) DO UPDATE SET
            sid = excluded.sid,
            version = excluded.version,
            level = excluded.level,
            mode = excluded.mode,
            status = excluded.status,
            length = excluded.length,
            heat = excluded.heat,
            donate_count = excluded.donate_count,
            play_count = excluded.play_count,
            last_updated = excluded.last_updated,
            creator_identity_id = excluded.creator_identity_id,
            creator_uid = excluded.creator_uid,
            creator_name = excluded.creator_name,
            stabilizer_identity_id = excluded.stabilizer_identity_id,
            stabilizer_uid = excluded.stabilizer_uid,
            stabilizer_name = excluded.stabilizer_name,
            crawled_at = excluded.crawled_at",
        params![
            chart.cid,
            chart.sid,
            chart.version,
            chart.level,
            chart.mode,
            chart.status.to_db_string(),
            chart.length_secs,
            chart.heat as i64,
            chart.donate_count as i64,
            chart.play_count as i64,
            last_updated,
            links.creator,
            chart.creator.as_ref().and_then(|p| p.uid),
            chart.creator.as_ref().map(|p| p.name.as_str()),
            links.stabilizer,
            chart.stabilizer.as_ref().and_then(|p| p.uid),
            chart.stabilizer.as_ref().map(|p| p.name.as_str()),
            at
        ],
    )?;
    Ok(())
}

impl CatalogStore for SqliteStore {
    // ===== Units of Work =====

    fn savepoint(&mut self, name: &str) -> StorageResult<()> {
        let name = savepoint_name(name)?;
        self.with_conn(|conn| conn.execute_batch(&format!("SAVEPOINT {}", name)))
    }

    fn release(&mut self, name: &str) -> StorageResult<()> {
        let name = savepoint_name(name)?;
        self.with_conn(|conn| conn.execute_batch(&format!("RELEASE SAVEPOINT {}", name)))
    }

    fn rollback_to(&mut self, name: &str) -> StorageResult<()> {
        let name = savepoint_name(name)?;
        self.with_conn(|conn| {
            conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0};",
                name
            ))
        })
    }

    // ===== Identities =====

    fn find_identity(&self, id: i64) -> StorageResult<Option<IdentityRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM identities WHERE id = ?1", IDENTITY_COLUMNS),
                params![id],
                identity_from_row,
            )
            .optional()
        })
    }

    fn find_identity_by_external_id(
        &self,
        external_id: &str,
    ) -> StorageResult<Option<IdentityRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM identities WHERE external_id = ?1",
                    IDENTITY_COLUMNS
                ),
                params![external_id],
                identity_from_row,
            )
            .optional()
        })
    }

    fn find_latest_alias(&self, display_name: &str) -> StorageResult<Option<AliasRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM aliases WHERE display_name = ?1
                     ORDER BY last_seen DESC, id DESC LIMIT 1",
                    ALIAS_COLUMNS
                ),
                params![display_name],
                alias_from_row,
            )
            .optional()
        })
    }

    fn insert_identity(
        &mut self,
        external_id: Option<&str>,
        display_name: &str,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let at = to_db_timestamp(&seen_at);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO identities (external_id, current_display_name, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?3)",
                params![external_id, display_name, at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn touch_identity(
        &mut self,
        id: i64,
        display_name: &str,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let at = to_db_timestamp(&seen_at);
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE identities SET
                    current_display_name = CASE WHEN ?3 >= last_seen
                        THEN ?2 ELSE current_display_name END,
                    last_seen = MAX(last_seen, ?3),
                    first_seen = MIN(first_seen, ?3)
                 WHERE id = ?1",
                params![id, display_name, at],
            )
        })?;

        if updated == 0 {
            return Err(StorageError::IdentityNotFound(id));
        }
        Ok(())
    }

    fn backfill_external_id(&mut self, id: i64, external_id: &str) -> StorageResult<()> {
        let updated = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE identities SET external_id = ?2 WHERE id = ?1",
                params![id, external_id],
            )?;
            conn.execute(
                "UPDATE aliases SET external_id = ?2 WHERE identity_id = ?1",
                params![id, external_id],
            )?;
            Ok(n)
        })?;

        if updated == 0 {
            return Err(StorageError::IdentityNotFound(id));
        }
        Ok(())
    }

    // ===== Aliases =====

    fn upsert_alias(
        &mut self,
        identity_id: i64,
        display_name: &str,
        external_id: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let at = to_db_timestamp(&seen_at);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO aliases (identity_id, display_name, external_id, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(identity_id, display_name) DO UPDATE SET
                    external_id = COALESCE(excluded.external_id, aliases.external_id),
                    first_seen = MIN(aliases.first_seen, excluded.first_seen),
                    last_seen = MAX(aliases.last_seen, excluded.last_seen)",
                params![identity_id, display_name, external_id, at],
            )?;
            Ok(())
        })
    }

    fn aliases_of(&self, identity_id: i64) -> StorageResult<Vec<AliasRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM aliases WHERE identity_id = ?1
                 ORDER BY last_seen DESC, id DESC",
                ALIAS_COLUMNS
            ))?;
            let aliases = stmt
                .query_map(params![identity_id], alias_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(aliases)
        })
    }

    // ===== Catalog Records =====

    fn upsert_record(
        &mut self,
        record: &Record,
        links: &RecordLinks,
        observed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let at = to_db_timestamp(&observed_at);
        self.with_conn(|conn| match record {
            Record::Song(song) => upsert_song(conn, song, &at),
            Record::Listing(listing) => upsert_listing(conn, listing, &at),
            Record::Chart(chart) => upsert_chart(conn, chart, links, &at),
            Record::Ranking { mode, row } => {
                conn.execute(
                    "INSERT OR REPLACE INTO ranking_snapshots
                        (mode, snapshot_at, rank, identity_id, display_name, level, exp,
                         accuracy, combo, play_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        mode,
                        at,
                        row.rank,
                        links.player,
                        row.name,
                        row.level,
                        row.exp as i64,
                        row.accuracy,
                        row.combo as i64,
                        row.play_count as i64
                    ],
                )?;
                Ok(())
            }
        })
    }

    // ===== Statistics =====

    fn counts(&self) -> StorageResult<StoreCounts> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, rusqlite::Error> {
                let n: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
                Ok(n as u64)
            };

            Ok(StoreCounts {
                identities: count("identities")?,
                aliases: count("aliases")?,
                songs: count("songs")?,
                charts: count("charts")?,
                ranking_rows: count("ranking_snapshots")?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChartStatus, PlayerRef, RankingRow};
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn song(sid: i64) -> SongRecord {
        SongRecord {
            sid,
            title: "Freedom Dive".to_string(),
            artist: "xi".to_string(),
            bpm: Some(222.22),
            length_secs: Some(260),
            cover_url: None,
        }
    }

    fn chart(cid: i64, sid: i64) -> ChartRecord {
        ChartRecord {
            cid,
            sid,
            version: "4K Another Lv.28".to_string(),
            level: Some("28".to_string()),
            mode: 0,
            status: ChartStatus::Stable,
            length_secs: Some(260),
            heat: 120,
            donate_count: 4,
            play_count: 9001,
            last_updated: None,
            creator: Some(PlayerRef {
                name: "mapper".to_string(),
                uid: Some(77),
            }),
            stabilizer: None,
        }
    }

    #[test]
    fn test_create_in_memory() {
        assert!(SqliteStore::open_in_memory().is_ok());
    }

    #[test]
    fn test_insert_and_find_identity() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert_identity(Some("U1"), "Alice", t(0)).unwrap();

        let found = store.find_identity_by_external_id("U1").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.current_display_name, "Alice");
        assert_eq!(found.first_seen, t(0));
        assert!(store.find_identity_by_external_id("U2").unwrap().is_none());
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert_identity(None, "Alice", t(10)).unwrap();

        store.touch_identity(id, "Alicia", t(5)).unwrap();
        let identity = store.find_identity(id).unwrap().unwrap();
        assert_eq!(identity.current_display_name, "Alice");
        assert_eq!(identity.last_seen, t(10));
        assert_eq!(identity.first_seen, t(5));

        store.touch_identity(id, "Alicia", t(20)).unwrap();
        let identity = store.find_identity(id).unwrap().unwrap();
        assert_eq!(identity.current_display_name, "Alicia");
        assert_eq!(identity.last_seen, t(20));
    }

    #[test]
    fn test_touch_missing_identity() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let result = store.touch_identity(42, "ghost", t(0));
        assert!(matches!(result, Err(StorageError::IdentityNotFound(42))));
    }

    #[test]
    fn test_alias_upsert_updates_instead_of_duplicating() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert_identity(None, "Alice", t(0)).unwrap();

        store.upsert_alias(id, "Alice", None, t(0)).unwrap();
        store.upsert_alias(id, "Alice", None, t(30)).unwrap();

        let aliases = store.aliases_of(id).unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].first_seen, t(0));
        assert_eq!(aliases[0].last_seen, t(30));
    }

    #[test]
    fn test_latest_alias_prefers_recent_activity() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let old = store.insert_identity(None, "X", t(0)).unwrap();
        let new = store.insert_identity(None, "X", t(50)).unwrap();
        store.upsert_alias(old, "X", None, t(0)).unwrap();
        store.upsert_alias(new, "X", None, t(50)).unwrap();

        let alias = store.find_latest_alias("X").unwrap().unwrap();
        assert_eq!(alias.identity_id, new);
    }

    #[test]
    fn test_backfill_reaches_aliases() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert_identity(None, "Alice", t(0)).unwrap();
        store.upsert_alias(id, "Alice", None, t(0)).unwrap();
        store.upsert_alias(id, "Ally", None, t(1)).unwrap();

        store.backfill_external_id(id, "U1").unwrap();

        assert!(store
            .aliases_of(id)
            .unwrap()
            .iter()
            .all(|a| a.external_id.as_deref() == Some("U1")));
        assert_eq!(
            store.find_identity_by_external_id("U1").unwrap().unwrap().id,
            id
        );
    }

    #[test]
    fn test_record_upserts_are_idempotent() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let creator = store.insert_identity(Some("77"), "mapper", t(0)).unwrap();
        let links = RecordLinks {
            creator: Some(creator),
            ..RecordLinks::default()
        };

        for _ in 0..2 {
            store
                .upsert_record(&Record::Song(song(5)), &RecordLinks::default(), t(0))
                .unwrap();
            store
                .upsert_record(&Record::Chart(chart(90, 5)), &links, t(0))
                .unwrap();
        }

        let counts = store.counts().unwrap();
        assert_eq!(counts.songs, 1);
        assert_eq!(counts.charts, 1);
    }

    #[test]
    fn test_listing_keeps_song_metadata() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_record(&Record::Song(song(5)), &RecordLinks::default(), t(0))
            .unwrap();
        store
            .upsert_record(
                &Record::Listing(SongListing {
                    sid: 5,
                    title: String::new(),
                    chart_ids: vec![90, 91],
                }),
                &RecordLinks::default(),
                t(1),
            )
            .unwrap();

        let (title, bpm): (String, Option<f64>) = store
            .with_conn(|conn| {
                conn.query_row("SELECT title, bpm FROM songs WHERE sid = 5", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
            })
            .unwrap();
        assert_eq!(title, "Freedom Dive");
        assert_eq!(bpm, Some(222.22));
    }

    #[test]
    fn test_chart_without_song_violates_foreign_key() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let result = store.upsert_record(&Record::Chart(chart(90, 404)), &RecordLinks::default(), t(0));
        assert!(result.is_err());
    }

    #[test]
    fn test_ranking_rows_keyed_by_snapshot() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let row = RankingRow {
            rank: 1,
            name: "top".to_string(),
            level: 60,
            exp: 123456,
            accuracy: 99.1,
            combo: 4000,
            play_count: 20000,
        };
        let record = Record::Ranking { mode: 0, row };

        store.upsert_record(&record, &RecordLinks::default(), t(0)).unwrap();
        store.upsert_record(&record, &RecordLinks::default(), t(0)).unwrap();
        store.upsert_record(&record, &RecordLinks::default(), t(60)).unwrap();

        assert_eq!(store.counts().unwrap().ranking_rows, 2);
    }

    #[test]
    fn test_unit_rollback_discards_writes() {
        let mut store = SqliteStore::open_in_memory().unwrap();

        store.begin_unit().unwrap();
        store.insert_identity(None, "kept", t(0)).unwrap();
        store.commit_unit().unwrap();

        store.begin_unit().unwrap();
        store.insert_identity(None, "dropped", t(1)).unwrap();
        store.rollback_unit().unwrap();

        assert_eq!(store.counts().unwrap().identities, 1);
        assert!(store.find_latest_alias("dropped").unwrap().is_none());
    }

    #[test]
    fn test_nested_savepoint_inside_unit() {
        let mut store = SqliteStore::open_in_memory().unwrap();

        store.begin_unit().unwrap();
        store.savepoint("inner").unwrap();
        store.insert_identity(None, "inner", t(0)).unwrap();
        store.release("inner").unwrap();
        store.rollback_unit().unwrap();

        assert_eq!(store.counts().unwrap().identities, 0);
    }

    #[test]
    fn test_rejects_bad_savepoint_name() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert!(store.savepoint("x; DROP TABLE songs").is_err());
    }
}
