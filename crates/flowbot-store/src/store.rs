use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use flowbot_core::config::EngineConfig;
use flowbot_core::error::{FlowbotError, Result};

use crate::schema::SCHEMA;

/// SQLite-backed store for locks, executions, history, and field captures.
///
/// All access goes through a single connection guarded by a mutex, so within
/// one process writes are serialized. The busy timeout only matters when
/// several processes share the same database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    pub(crate) lock_stale_after: Duration,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowbotError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            lock_stale_after: Duration::from_secs(30),
        }
    }

    /// Apply the lock timing knobs from the engine config.
    pub fn with_lock_settings(self, config: &EngineConfig) -> Result<Self> {
        self.conn()?
            .busy_timeout(config.lock_busy_timeout())
            .map_err(db_err)?;
        Ok(Self {
            lock_stale_after: config.lock_stale_after(),
            ..self
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowbotError::Database(format!("connection mutex poisoned: {}", e)))
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> FlowbotError {
    FlowbotError::Database(e.to_string())
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}
