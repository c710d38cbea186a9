//! SQLite-backed local store
//!
//! One database holds the op log, the snapshot slots and sync metadata for
//! every document. The handle is cheap to clone; clones share a single
//! connection so writes from one document never race each other.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};
use crate::document_id::DocumentId;
use crate::models::{Clock, Timestamp};

/// Durable local state of the sync engine
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<Clock>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        debug!("Opened local store at {:?}", path);
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> StorageResult<Self> {
        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        let floor: Timestamp = conn.query_row(
            "SELECT MAX(
                COALESCE((SELECT MAX(created_at) FROM ops), 0),
                COALESCE((SELECT MAX(updated_at) FROM snapshots), 0)
            )",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(Clock::starting_after(floor)),
            path,
        })
    }

    /// Database file, if this store is on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Next local timestamp; strictly after anything already persisted
    pub fn next_timestamp(&self) -> Timestamp {
        self.clock.next()
    }

    pub(super) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub(super) fn observe_timestamp(&self, ts: Timestamp) {
        self.clock.observe(ts);
    }

    /// Every document with any local state
    pub fn document_ids(&self) -> StorageResult<Vec<DocumentId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT document_id FROM ops
             UNION SELECT document_id FROM snapshots
             UNION SELECT document_id FROM sync_meta
             ORDER BY 1",
        )?;
        let raw: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        raw.iter()
            .map(|text| parse_document_id("ops", text))
            .collect()
    }

    /// Drop all local state for a document (op log, snapshot and metadata)
    pub fn clear_document(&self, document_id: &DocumentId) -> StorageResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let key = document_id.to_bs58check();
        tx.execute("DELETE FROM ops WHERE document_id = ?1", [&key])?;
        tx.execute("DELETE FROM snapshots WHERE document_id = ?1", [&key])?;
        tx.execute("DELETE FROM sync_meta WHERE document_id = ?1", [&key])?;
        tx.commit()?;
        debug!("Cleared local state for document {}", document_id);
        Ok(())
    }
}

pub(super) fn parse_document_id(table: &'static str, text: &str) -> StorageResult<DocumentId> {
    DocumentId::from_bs58check(text).map_err(|e| StorageError::CorruptRow {
        table,
        details: format!("invalid document id '{}': {}", text, e),
    })
}
