//! SQLite store for CRM entities, calendar links, integrations, notifications
//! and the chat inbox.
//!
//! The database lives at `~/.nuvra/nuvra.db` unless the config names another
//! path. Each table family gets its own `impl CrmDb` block in a submodule.
//! Async callers share one connection through `SharedDb`; the guard is never
//! held across an `.await`.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;

pub mod activities;
pub mod calendar;
pub mod chat;
pub mod entities;
pub mod integrations;
pub mod notifications;
pub mod reports;
pub mod sessions;
pub mod types;

pub use types::*;

pub type SharedDb = Arc<parking_lot::Mutex<CrmDb>>;

pub struct CrmDb {
    conn: Connection,
}

impl CrmDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default location.
    pub fn open() -> Result<Self, DbError> {
        Self::open_at(crate::util::nuvra_home().join("nuvra.db"))
    }

    /// Open a database at an explicit path and bring its schema up to date.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        log::debug!("Opened database at {}", path.display());
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedDb {
        Arc::new(parking_lot::Mutex::new(self))
    }
}

/// Collect a `query_map` iterator, propagating the first row error.
pub(crate) fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, DbError> {
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

/// `%term%` for case-insensitive LIKE filters.
pub(crate) fn like_pattern(term: &str) -> String {
    format!("%{}%", term.trim().to_lowercase())
}

#[cfg(test)]
pub mod test_utils {
    use super::CrmDb;

    /// Create a temporary database for testing.
    ///
    /// The `TempDir` is leaked so the directory outlives the connection.
    pub fn test_db() -> CrmDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        CrmDb::open_at(path).expect("Failed to open test database")
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_at_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crm.db");
        let db = CrmDb::open_at(path.clone()).unwrap();
        assert!(path.exists());

        let fk: i64 = db
            .conn_ref()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.conn_ref().execute(
                "INSERT INTO api_sessions (token, user_id, created_at) VALUES ('t', 'u', 'now')",
                [],
            )?;
            Err(DbError::Validation("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM api_sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
