//! SQLite schema for the local sync store
//!
//! Three logical stores live in one database:
//! - `ops`: encrypted deltas, keyed by op id, looked up by
//!   `(document_id, pushed)` and `(document_id, created_at)`
//! - `snapshots`: at most one encrypted checkpoint per document
//! - `sync_meta`: free-form key/value scratch space per document

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Encrypted deltas
        CREATE TABLE IF NOT EXISTS ops (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            version_marker BLOB NOT NULL,
            ciphertext BLOB NOT NULL,
            pushed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        -- Encrypted checkpoints (single slot per document)
        CREATE TABLE IF NOT EXISTS snapshots (
            document_id TEXT PRIMARY KEY,
            version_marker BLOB NOT NULL,
            ciphertext BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Cursors and flags
        CREATE TABLE IF NOT EXISTS sync_meta (
            document_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (document_id, key)
        );

        -- Unpushed lookups (push loop, unsaved-changes checks)
        CREATE INDEX IF NOT EXISTS idx_ops_document_pushed ON ops(document_id, pushed);

        -- Replay order and compaction pressure
        CREATE INDEX IF NOT EXISTS idx_ops_document_created_at ON ops(document_id, created_at);
        "#,
    )?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
