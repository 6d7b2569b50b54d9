pub mod processed;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Thread-safe SQLite ledger of messages that already produced an alert.
///
/// `message_id` is the primary key, so concurrent writers for the same
/// message are arbitrated by SQLite itself.
#[derive(Clone)]
pub struct ProcessedStore {
    conn: Arc<Mutex<Connection>>,
}

impl ProcessedStore {
    /// Open or create the database at `path` and make sure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Self::run_migrations(&conn).context("Failed to create processed_messages schema")?;

        info!("Processed-message store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS processed_messages (
                message_id INTEGER PRIMARY KEY,
                chat_id INTEGER NOT NULL,
                chat_key TEXT NOT NULL,
                processed_at TEXT NOT NULL
            );
            ",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_fails_on_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProcessedStore::open(dir.path()).is_err());
    }

    #[test]
    fn test_open_fails_on_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        std::fs::write(&path, vec![0x5a_u8; 4096]).unwrap();

        assert!(ProcessedStore::open(&path).is_err());
    }

    #[test]
    fn test_open_creates_schema_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");

        ProcessedStore::open(&path).unwrap();
        // Reopening an initialized database is a no-op
        ProcessedStore::open(&path).unwrap();

        let conn = Connection::open(&path).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='processed_messages'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }
}
