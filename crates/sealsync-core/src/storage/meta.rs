//! Sync metadata
//!
//! Free-form string values namespaced by document.

use rusqlite::{params, OptionalExtension};

use super::error::StorageResult;
use super::store::LocalStore;
use crate::document_id::DocumentId;

/// Well-known metadata keys
pub mod keys {
    /// Version marker recorded after the last successful sync (base64)
    pub const LAST_SYNCED_VERSION: &str = "last_synced_version";
    /// Last snapshot version agreed with the relay
    pub const SNAPSHOT_VERSION: &str = "snapshot_version";
}

impl LocalStore {
    pub fn set_meta(&self, document_id: &DocumentId, key: &str, value: &str) -> StorageResult<()> {
        self.conn().execute(
            "INSERT INTO sync_meta (document_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(document_id, key) DO UPDATE SET value = excluded.value",
            params![document_id.to_bs58check(), key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, document_id: &DocumentId, key: &str) -> StorageResult<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT value FROM sync_meta WHERE document_id = ?1 AND key = ?2",
                params![document_id.to_bs58check(), key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn delete_meta(&self, document_id: &DocumentId, key: &str) -> StorageResult<bool> {
        let removed = self.conn().execute(
            "DELETE FROM sync_meta WHERE document_id = ?1 AND key = ?2",
            params![document_id.to_bs58check(), key],
        )?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_overwrite() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();

        assert_eq!(store.get_meta(&doc, keys::SNAPSHOT_VERSION).unwrap(), None);

        store.set_meta(&doc, keys::SNAPSHOT_VERSION, "1").unwrap();
        store.set_meta(&doc, keys::SNAPSHOT_VERSION, "2").unwrap();
        assert_eq!(
            store.get_meta(&doc, keys::SNAPSHOT_VERSION).unwrap(),
            Some("2".to_string())
        );
    }

    #[test]
    fn test_namespaced_by_document() {
        let store = LocalStore::open_in_memory().unwrap();
        let a = DocumentId::new();
        let b = DocumentId::new();

        store.set_meta(&a, "cursor", "a").unwrap();
        assert_eq!(store.get_meta(&b, "cursor").unwrap(), None);
    }

    #[test]
    fn test_delete() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        store.set_meta(&doc, "cursor", "1").unwrap();

        assert!(store.delete_meta(&doc, "cursor").unwrap());
        assert!(!store.delete_meta(&doc, "cursor").unwrap());
    }
}
