//! Storage traits and error types
//!
//! This module defines the trait interface for catalog stores and
//! associated error types.

use crate::storage::{AliasRecord, IdentityRecord, Record, RecordLinks, StoreCounts};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store unavailable at {path}: {source}")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Connection lock poisoned")]
    Poisoned,

    #[error("Identity not found: {0}")]
    IdentityNotFound(i64),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const UNIT_SAVEPOINT: &str = "harvest_unit";

/// Trait for catalog store implementations
///
/// Writes happen inside named savepoints so a unit of work can be committed
/// or rolled back as a whole, and so the identity resolver can nest its own
/// savepoint inside an open unit.
pub trait CatalogStore {
    // ===== Units of Work =====

    /// Opens a named savepoint (starts a transaction if none is open)
    fn savepoint(&mut self, name: &str) -> StorageResult<()>;

    /// Releases a named savepoint, committing if it was the outermost
    fn release(&mut self, name: &str) -> StorageResult<()>;

    /// Undoes everything since the named savepoint and closes it
    fn rollback_to(&mut self, name: &str) -> StorageResult<()>;

    /// Starts a unit of work
    fn begin_unit(&mut self) -> StorageResult<()> {
        self.savepoint(UNIT_SAVEPOINT)
    }

    /// Commits the open unit of work
    fn commit_unit(&mut self) -> StorageResult<()> {
        self.release(UNIT_SAVEPOINT)
    }

    /// Discards the open unit of work
    fn rollback_unit(&mut self) -> StorageResult<()> {
        self.rollback_to(UNIT_SAVEPOINT)
    }

    // ===== Identities =====

    /// Gets an identity by surrogate id
    fn find_identity(&self, id: i64) -> StorageResult<Option<IdentityRecord>>;

    /// Gets the identity that owns `external_id`
    fn find_identity_by_external_id(&self, external_id: &str)
        -> StorageResult<Option<IdentityRecord>>;

    /// Gets the most recently active alias carrying `display_name`
    ///
    /// Ties on `last_seen` go to the newest alias row.
    fn find_latest_alias(&self, display_name: &str) -> StorageResult<Option<AliasRecord>>;

    /// Creates an identity and returns its id
    fn insert_identity(
        &mut self,
        external_id: Option<&str>,
        display_name: &str,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<i64>;

    /// Records a new sighting of an identity
    ///
    /// `last_seen` only moves forward; the current display name is replaced
    /// unless the sighting is older than the latest one already stored.
    fn touch_identity(
        &mut self,
        id: i64,
        display_name: &str,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Sets the external id on an identity and all of its aliases
    fn backfill_external_id(&mut self, id: i64, external_id: &str) -> StorageResult<()>;

    // ===== Aliases =====

    /// Inserts or refreshes the alias `(identity_id, display_name)`
    fn upsert_alias(
        &mut self,
        identity_id: i64,
        display_name: &str,
        external_id: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Gets every alias of an identity, most recent first
    fn aliases_of(&self, identity_id: i64) -> StorageResult<Vec<AliasRecord>>;

    // ===== Catalog Records =====

    /// Writes a record, idempotent by its natural key
    fn upsert_record(
        &mut self,
        record: &Record,
        links: &RecordLinks,
        observed_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    // ===== Statistics =====

    /// Counts rows in every catalog table
    fn counts(&self) -> StorageResult<StoreCounts>;
}
