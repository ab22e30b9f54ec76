//! `SQLite` persistence for the call ledger.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result as SqliteResult};
use std::path::Path;

/// `SQLite`-backed store for remote call timestamps.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(
            r"
            -- One row per remote API call, unix milliseconds
            CREATE TABLE IF NOT EXISTS api_calls (
                called_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_api_calls_called_at ON api_calls(called_at);
            ",
        )?;

        Ok(())
    }

    /// Replace the stored ledger with `calls`.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub fn save_ledger(&mut self, calls: &[DateTime<Utc>]) -> SqliteResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM api_calls", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO api_calls (called_at) VALUES (?1)")?;
            for at in calls {
                stmt.execute([at.timestamp_millis()])?;
            }
        }
        tx.commit()
    }

    /// Calls made at or after `since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn load_ledger_since(&self, since: DateTime<Utc>) -> SqliteResult<Vec<DateTime<Utc>>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT called_at FROM api_calls
            WHERE called_at >= ?1
            ORDER BY called_at ASC
            ",
        )?;

        let calls = stmt
            .query_map([since.timestamp_millis()], |row| row.get::<_, i64>(0))?
            .collect::<SqliteResult<Vec<i64>>>()?
            .into_iter()
            .filter_map(DateTime::<Utc>::from_timestamp_millis)
            .collect();

        Ok(calls)
    }

    /// Drop calls older than `before`.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub fn prune_before(&self, before: DateTime<Utc>) -> SqliteResult<usize> {
        self.conn.execute(
            "DELETE FROM api_calls WHERE called_at < ?1",
            [before.timestamp_millis()],
        )
    }
}
