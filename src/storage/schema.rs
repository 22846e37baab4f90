//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Chart-Harvest database.

/// Current schema version, recorded in `schema_meta`
pub const SCHEMA_VERSION: u32 = 1;

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per real-world player, stable across renames
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT UNIQUE,
    current_display_name TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL
);

-- Every display name an identity has been seen with
CREATE TABLE IF NOT EXISTS aliases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL REFERENCES identities(id),
    display_name TEXT NOT NULL,
    external_id TEXT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    UNIQUE(identity_id, display_name)
);

CREATE INDEX IF NOT EXISTS idx_aliases_name ON aliases(display_name, last_seen);

CREATE TABLE IF NOT EXISTS songs (
    sid INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    artist TEXT,
    bpm REAL,
    length INTEGER,
    cover_url TEXT,
    crawled_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS charts (
    cid INTEGER PRIMARY KEY,
    sid INTEGER NOT NULL REFERENCES songs(sid),
    version TEXT NOT NULL,
    level TEXT,
    mode INTEGER NOT NULL,
    status TEXT NOT NULL,
    length INTEGER,
    heat INTEGER NOT NULL DEFAULT 0,
    donate_count INTEGER NOT NULL DEFAULT 0,
    play_count INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT,
    creator_identity_id INTEGER REFERENCES identities(id),
    creator_uid INTEGER,
    creator_name TEXT,
    stabilizer_identity_id INTEGER REFERENCES identities(id),
    stabilizer_uid INTEGER,
    stabilizer_name TEXT,
    crawled_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_charts_sid ON charts(sid);
CREATE INDEX IF NOT EXISTS idx_charts_creator ON charts(creator_identity_id);

CREATE TABLE IF NOT EXISTS ranking_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mode INTEGER NOT NULL,
    snapshot_at TEXT NOT NULL,
    rank INTEGER NOT NULL,
    identity_id INTEGER REFERENCES identities(id),
    display_name TEXT NOT NULL,
    level INTEGER NOT NULL,
    exp INTEGER NOT NULL,
    accuracy REAL NOT NULL,
    combo INTEGER NOT NULL,
    play_count INTEGER NOT NULL,
    UNIQUE(mode, snapshot_at, rank)
);

CREATE INDEX IF NOT EXISTS idx_rankings_identity ON ranking_snapshots(identity_id);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}
