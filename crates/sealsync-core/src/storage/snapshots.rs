//! Local snapshot store
//!
//! Single slot per document: saving overwrites whatever was there.

use rusqlite::{params, OptionalExtension};

use super::error::StorageResult;
use super::store::{parse_document_id, LocalStore};
use crate::document_id::DocumentId;
use crate::models::{Snapshot, Timestamp, VersionMarker};

impl LocalStore {
    /// Upsert the snapshot of its document
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()> {
        self.conn().execute(
            "INSERT INTO snapshots (document_id, version_marker, ciphertext, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(document_id) DO UPDATE SET
                version_marker = excluded.version_marker,
                ciphertext = excluded.ciphertext,
                updated_at = excluded.updated_at",
            params![
                snapshot.document_id.to_bs58check(),
                snapshot.version_marker.as_bytes(),
                snapshot.ciphertext,
                snapshot.updated_at,
            ],
        )?;
        self.observe_timestamp(snapshot.updated_at);
        Ok(())
    }

    pub fn load_snapshot(&self, document_id: &DocumentId) -> StorageResult<Option<Snapshot>> {
        let row: Option<(String, Vec<u8>, Vec<u8>, Timestamp)> = self
            .conn()
            .query_row(
                "SELECT document_id, version_marker, ciphertext, updated_at
                 FROM snapshots WHERE document_id = ?1",
                [document_id.to_bs58check()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(|(doc, marker, ciphertext, updated_at)| {
            Ok(Snapshot {
                document_id: parse_document_id("snapshots", &doc)?,
                version_marker: VersionMarker::new(marker),
                ciphertext,
                updated_at,
            })
        })
        .transpose()
    }

    /// Remove the snapshot; returns whether one existed
    pub fn delete_snapshot(&self, document_id: &DocumentId) -> StorageResult<bool> {
        let removed = self.conn().execute(
            "DELETE FROM snapshots WHERE document_id = ?1",
            [document_id.to_bs58check()],
        )?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(doc: DocumentId, payload: &[u8], updated_at: Timestamp) -> Snapshot {
        Snapshot {
            document_id: doc,
            version_marker: VersionMarker::new(payload.to_vec()),
            ciphertext: payload.to_vec(),
            updated_at,
        }
    }

    #[test]
    fn test_save_and_load() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();

        assert!(store.load_snapshot(&doc).unwrap().is_none());

        let saved = snapshot(doc, b"first", 100);
        store.save_snapshot(&saved).unwrap();
        assert_eq!(store.load_snapshot(&doc).unwrap(), Some(saved));
    }

    #[test]
    fn test_save_overwrites_single_slot() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();

        store.save_snapshot(&snapshot(doc, b"first", 100)).unwrap();
        store.save_snapshot(&snapshot(doc, b"second", 200)).unwrap();

        let loaded = store.load_snapshot(&doc).unwrap().unwrap();
        assert_eq!(loaded.ciphertext, b"second");
        assert_eq!(loaded.updated_at, 200);

        let rows: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_delete() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        store.save_snapshot(&snapshot(doc, b"x", 1)).unwrap();

        assert!(store.delete_snapshot(&doc).unwrap());
        assert!(!store.delete_snapshot(&doc).unwrap());
        assert!(store.load_snapshot(&doc).unwrap().is_none());
    }

    #[test]
    fn test_saving_advances_clock() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        let far_future = chrono::Utc::now().timestamp_millis() + 3_600_000;

        store.save_snapshot(&snapshot(doc, b"x", far_future)).unwrap();
        assert!(store.next_timestamp() > far_future);
    }
}
