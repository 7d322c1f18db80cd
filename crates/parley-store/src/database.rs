//! SQLite document backend.
//!
//! [`SqliteStore`] keeps one row per document and upserts that row on every
//! save, so a write touches only the document that changed. Migrations run
//! before the store is handed out.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::DocumentStore;

/// File name used inside the data directory.
pub const DATABASE_FILE: &str = "parley.db";

/// Wrapper around a [`rusqlite::Connection`].
///
/// The connection is not `Sync`, so it sits behind a mutex; every document
/// operation is a single short statement.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) `parley.db` inside `data_dir`.
    pub fn open_in(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DATABASE_FILE);

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl DocumentStore for SqliteStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let body = conn
            .query_row(
                "SELECT body FROM documents WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(body)
    }

    fn save_raw(&self, key: &str, body: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO documents (key, body, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![key, body, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_in(dir.path()).expect("should open");
        assert_eq!(store.path(), Some(dir.path().join(DATABASE_FILE).as_path()));
    }

    #[test]
    fn save_overwrites_previous_body() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.load_raw("blocks").unwrap(), None);

        store.save_raw("blocks", "{}").unwrap();
        store.save_raw("blocks", r#"{"alice":["eve"]}"#).unwrap();

        assert_eq!(
            store.load_raw("blocks").unwrap().as_deref(),
            Some(r#"{"alice":["eve"]}"#)
        );
    }

    #[test]
    fn reopen_keeps_documents_and_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = SqliteStore::open_at(&path).unwrap();
            store.save_raw("broadcast_history", "[]").unwrap();
        }

        let store = SqliteStore::open_at(&path).unwrap();
        assert_eq!(
            store.load_raw("broadcast_history").unwrap().as_deref(),
            Some("[]")
        );

        let conn = store.conn.lock().unwrap();
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }
}
