//! v001 -- Initial schema creation.
//!
//! A single `documents` table: one row per logical document, body stored as
//! JSON text.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    key        TEXT PRIMARY KEY NOT NULL,   -- logical document name
    body       TEXT NOT NULL,               -- JSON
    updated_at TEXT NOT NULL                -- RFC-3339
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
