pub mod command_log;
pub mod migrations;
pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

/// Typed storage failures. Callers must treat `AlreadyResolved` as success
/// under retries; `StorageUnavailable` means the write may not have taken
/// effect.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("command {0} not found")]
    NotFound(i64),

    #[error("command {0} already resolved")]
    AlreadyResolved(i64),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for LogError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, LogError> {
        let conn = Connection::open(path)?;
        Self::init(conn, &path.display().to_string())
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, LogError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self, LogError> {
        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        info!("Database opened at {}", label);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LogError>
    where
        F: FnOnce(&Connection) -> Result<T, LogError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LogError::StorageUnavailable(format!("DB lock poisoned: {}", e)))?;
        f(&conn)
    }
}
