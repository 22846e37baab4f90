//! Per-worker SQLite connection registry
//!
//! Each logical worker (the crawl loop, a status query, a leaderboard
//! snapshot) gets exactly one connection, created lazily and configured once.
//! The registry lock only guards the map; queries lock the connection itself.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{StorageError, StorageResult};
use rusqlite::Connection;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A shared handle to one pooled connection
pub type PooledConnection = Arc<Mutex<Connection>>;

/// Name of a logical worker holding a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Lazily opened connections keyed by worker
pub struct ConnectionPool {
    path: PathBuf,
    busy_timeout: Duration,
    connections: Mutex<HashMap<WorkerId, PooledConnection>>,
}

impl ConnectionPool {
    /// Creates an empty pool for the database at `path`
    ///
    /// Nothing is opened until the first [`acquire`](Self::acquire).
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the worker's connection, opening and configuring it on first use
    ///
    /// # Returns
    ///
    /// * `Ok(PooledConnection)` - The same handle for every call with the same worker
    /// * `Err(StorageError::StoreUnavailable)` - The database could not be opened
    pub fn acquire(&self, worker: &WorkerId) -> StorageResult<PooledConnection> {
        let mut connections = self
            .connections
            .lock()
            .map_err(|_| StorageError::Poisoned)?;

        if let Some(conn) = connections.get(worker) {
            return Ok(Arc::clone(conn));
        }

        let conn = open_connection(&self.path, self.busy_timeout).map_err(|source| {
            StorageError::StoreUnavailable {
                path: self.path.clone(),
                source,
            }
        })?;

        tracing::debug!("Opened connection for worker {}", worker);
        let conn = Arc::new(Mutex::new(conn));
        connections.insert(worker.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Number of workers currently holding a connection
    pub fn len(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every pooled connection
    ///
    /// Connections still borrowed elsewhere are dropped from the registry and
    /// close when their last handle goes away.
    pub fn release_all(&self) -> StorageResult<usize> {
        let drained: Vec<(WorkerId, PooledConnection)> = {
            let mut connections = self
                .connections
                .lock()
                .map_err(|_| StorageError::Poisoned)?;
            connections.drain().collect()
        };

        let released = drained.len();
        for (worker, conn) in drained {
            let Ok(mutex) = Arc::try_unwrap(conn) else {
                tracing::debug!("Connection for {} still in use, closing on drop", worker);
                continue;
            };
            let conn = mutex.into_inner().map_err(|_| StorageError::Poisoned)?;
            if let Err((_, e)) = conn.close() {
                tracing::warn!("Failed to close connection for {}: {}", worker, e);
            }
        }

        Ok(released)
    }
}

/// Opens a database file with the durability and locking settings every worker uses
fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
    ",
    )?;
    conn.busy_timeout(busy_timeout)?;

    initialize_schema(&conn)?;

    Ok(conn)
}
