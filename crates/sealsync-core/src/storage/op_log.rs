//! Local op log
//!
//! Append-only store of encrypted deltas per document. An op is written
//! unpushed and flipped to pushed once the relay acknowledges it. Pushed
//! ops are immutable; they are only ever deleted once a snapshot covers
//! them.

use rusqlite::{params, Connection, Row};
use tracing::debug;

use super::error::StorageResult;
use super::store::{parse_document_id, LocalStore};
use crate::document_id::DocumentId;
use crate::models::{Op, OpId, OpStats, Timestamp, VersionMarker};

const OP_COLUMNS: &str = "id, document_id, version_marker, ciphertext, pushed, created_at";

/// Row as stored, before the document id is validated
struct RawOp {
    id: String,
    document_id: String,
    version_marker: Vec<u8>,
    ciphertext: Vec<u8>,
    pushed: bool,
    created_at: Timestamp,
}

impl RawOp {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            version_marker: row.get(2)?,
            ciphertext: row.get(3)?,
            pushed: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_op(self) -> StorageResult<Op> {
        Ok(Op {
            id: self.id,
            document_id: parse_document_id("ops", &self.document_id)?,
            version_marker: VersionMarker::new(self.version_marker),
            ciphertext: self.ciphertext,
            pushed: self.pushed,
            created_at: self.created_at,
        })
    }
}

fn query_ops(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> StorageResult<Vec<Op>> {
    let mut stmt = conn.prepare(sql)?;
    let raw: Vec<RawOp> = stmt
        .query_map(params, RawOp::from_row)?
        .collect::<Result<_, _>>()?;
    raw.into_iter().map(RawOp::into_op).collect()
}

impl LocalStore {
    /// Durably insert an op
    ///
    /// Returns only after SQLite has committed the row. A duplicate op id is
    /// an error, not a silent overwrite.
    pub fn append_op(&self, op: &Op) -> StorageResult<()> {
        self.conn().execute(
            &format!("INSERT INTO ops ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)", OP_COLUMNS),
            params![
                op.id,
                op.document_id.to_bs58check(),
                op.version_marker.as_bytes(),
                op.ciphertext,
                op.pushed,
                op.created_at,
            ],
        )?;
        self.observe_timestamp(op.created_at);
        Ok(())
    }

    /// All unpushed ops of a document, oldest first
    pub fn unpushed_ops(&self, document_id: &DocumentId) -> StorageResult<Vec<Op>> {
        let conn = self.conn();
        query_ops(
            &conn,
            &format!(
                "SELECT {} FROM ops WHERE document_id = ?1 AND pushed = 0
                 ORDER BY created_at ASC, rowid ASC",
                OP_COLUMNS
            ),
            [document_id.to_bs58check()],
        )
    }

    /// Whether any op of the document still awaits the relay
    pub fn has_unpushed(&self, document_id: &DocumentId) -> StorageResult<bool> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT 1 FROM ops WHERE document_id = ?1 AND pushed = 0 LIMIT 1")?;
        Ok(stmt.exists([document_id.to_bs58check()])?)
    }

    pub fn unpushed_count(&self, document_id: &DocumentId) -> StorageResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM ops WHERE document_id = ?1 AND pushed = 0",
            [document_id.to_bs58check()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Mark ops as acknowledged
    ///
    /// Unknown or already-pushed ids are ignored. Returns how many rows
    /// actually changed.
    pub fn mark_pushed(&self, ids: &[OpId]) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare("UPDATE ops SET pushed = 1 WHERE id = ?1 AND pushed = 0")?;
            for id in ids {
                changed += stmt.execute([id])?;
            }
        }
        tx.commit()?;

        debug!("Marked {} of {} op(s) as pushed", changed, ids.len());
        Ok(changed)
    }

    /// Ops created strictly after `since`, oldest first
    pub fn ops_since(&self, document_id: &DocumentId, since: Timestamp) -> StorageResult<Vec<Op>> {
        let conn = self.conn();
        query_ops(
            &conn,
            &format!(
                "SELECT {} FROM ops WHERE document_id = ?1 AND created_at > ?2
                 ORDER BY created_at ASC, rowid ASC",
                OP_COLUMNS
            ),
            params![document_id.to_bs58check(), since],
        )
    }

    /// Count and total ciphertext size of ops newer than the local snapshot
    ///
    /// Without a snapshot every op counts.
    pub fn count_ops_since_snapshot(&self, document_id: &DocumentId) -> StorageResult<OpStats> {
        let since = self
            .load_snapshot(document_id)?
            .map(|snapshot| snapshot.updated_at)
            .unwrap_or(Timestamp::MIN);

        let (count, bytes): (i64, i64) = self.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(ciphertext)), 0)
             FROM ops WHERE document_id = ?1 AND created_at > ?2",
            params![document_id.to_bs58check(), since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(OpStats {
            count: count as u64,
            bytes: bytes as u64,
        })
    }

    /// Delete pushed ops created at or before `until`
    ///
    /// Unpushed ops are never pruned.
    pub fn prune_pushed_before(
        &self,
        document_id: &DocumentId,
        until: Timestamp,
    ) -> StorageResult<usize> {
        let removed = self.conn().execute(
            "DELETE FROM ops WHERE document_id = ?1 AND pushed = 1 AND created_at <= ?2",
            params![document_id.to_bs58check(), until],
        )?;
        if removed > 0 {
            debug!("Pruned {} pushed op(s) for document {}", removed, document_id);
        }
        Ok(removed)
    }

    /// Wipe the op log of a document
    pub fn clear_ops(&self, document_id: &DocumentId) -> StorageResult<usize> {
        Ok(self.conn().execute(
            "DELETE FROM ops WHERE document_id = ?1",
            [document_id.to_bs58check()],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Snapshot;

    fn op(doc: DocumentId, id: &str, created_at: Timestamp, bytes: &[u8]) -> Op {
        Op {
            id: id.to_string(),
            document_id: doc,
            version_marker: VersionMarker::new(vec![created_at as u8]),
            ciphertext: bytes.to_vec(),
            pushed: false,
            created_at,
        }
    }

    fn ids(ops: &[Op]) -> Vec<&str> {
        ops.iter().map(|op| op.id.as_str()).collect()
    }

    #[test]
    fn test_append_then_mark_pushed() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();

        for (i, id) in ["op-1", "op-2", "op-3"].iter().enumerate() {
            store.append_op(&op(doc, id, 10 + i as i64, b"x")).unwrap();
        }
        assert_eq!(ids(&store.unpushed_ops(&doc).unwrap()), ["op-1", "op-2", "op-3"]);

        store
            .mark_pushed(&["op-1".to_string(), "op-2".to_string()])
            .unwrap();
        assert_eq!(ids(&store.unpushed_ops(&doc).unwrap()), ["op-3"]);
    }

    #[test]
    fn test_unpushed_ordered_by_created_at_then_insertion() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();

        store.append_op(&op(doc, "late", 30, b"x")).unwrap();
        store.append_op(&op(doc, "early", 10, b"x")).unwrap();
        store.append_op(&op(doc, "tie-a", 20, b"x")).unwrap();
        store.append_op(&op(doc, "tie-b", 20, b"x")).unwrap();

        assert_eq!(
            ids(&store.unpushed_ops(&doc).unwrap()),
            ["early", "tie-a", "tie-b", "late"]
        );
    }

    #[test]
    fn test_mark_pushed_is_idempotent() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        store.append_op(&op(doc, "op-1", 1, b"x")).unwrap();

        assert_eq!(store.mark_pushed(&["op-1".to_string()]).unwrap(), 1);
        assert_eq!(store.mark_pushed(&["op-1".to_string()]).unwrap(), 0);
        assert_eq!(store.mark_pushed(&["nope".to_string()]).unwrap(), 0);
        assert_eq!(store.mark_pushed(&[]).unwrap(), 0);
        assert!(!store.has_unpushed(&doc).unwrap());
    }

    #[test]
    fn test_partial_acknowledgement_leaves_rest_unpushed() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        for i in 1..=5 {
            store
                .append_op(&op(doc, &format!("op-{}", i), i, b"x"))
                .unwrap();
        }

        let acked: Vec<OpId> = ["op-1", "op-3", "op-5"].iter().map(|s| s.to_string()).collect();
        assert_eq!(store.mark_pushed(&acked).unwrap(), 3);

        assert_eq!(ids(&store.unpushed_ops(&doc).unwrap()), ["op-2", "op-4"]);
        assert_eq!(store.unpushed_count(&doc).unwrap(), 2);
    }

    #[test]
    fn test_duplicate_id_is_an_error() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        store.append_op(&op(doc, "op-1", 1, b"x")).unwrap();

        assert!(store.append_op(&op(doc, "op-1", 2, b"y")).is_err());
    }

    #[test]
    fn test_documents_are_isolated() {
        let store = LocalStore::open_in_memory().unwrap();
        let a = DocumentId::new();
        let b = DocumentId::new();
        store.append_op(&op(a, "a-1", 1, b"x")).unwrap();

        assert!(store.has_unpushed(&a).unwrap());
        assert!(!store.has_unpushed(&b).unwrap());
        assert!(store.unpushed_ops(&b).unwrap().is_empty());
    }

    #[test]
    fn test_count_ops_since_snapshot() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();

        store.append_op(&op(doc, "old", 90, b"ignored")).unwrap();
        store
            .save_snapshot(&Snapshot {
                document_id: doc,
                version_marker: VersionMarker::empty(),
                ciphertext: vec![0; 4],
                updated_at: 100,
            })
            .unwrap();

        let payloads: [&[u8]; 5] = [b"a", b"bb", b"ccc", b"dddd", b"eeeee"];
        for (i, payload) in payloads.iter().enumerate() {
            let ts = 110 + 10 * i as i64;
            store.append_op(&op(doc, &format!("op-{}", ts), ts, payload)).unwrap();
        }

        let stats = store.count_ops_since_snapshot(&doc).unwrap();
        assert_eq!(stats, OpStats { count: 5, bytes: 15 });
    }

    #[test]
    fn test_count_without_snapshot_counts_everything() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        store.append_op(&op(doc, "a", 1, b"abc")).unwrap();
        store.append_op(&op(doc, "b", 2, b"de")).unwrap();
        store.mark_pushed(&["a".to_string()]).unwrap();

        let stats = store.count_ops_since_snapshot(&doc).unwrap();
        assert_eq!(stats, OpStats { count: 2, bytes: 5 });
    }

    #[test]
    fn test_ops_since() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        for ts in [10, 20, 30] {
            store.append_op(&op(doc, &format!("op-{}", ts), ts, b"x")).unwrap();
        }

        assert_eq!(ids(&store.ops_since(&doc, 10).unwrap()), ["op-20", "op-30"]);
        assert!(store.ops_since(&doc, 30).unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_unpushed() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        store.append_op(&op(doc, "pushed-old", 10, b"x")).unwrap();
        store.append_op(&op(doc, "unpushed-old", 20, b"x")).unwrap();
        store.append_op(&op(doc, "pushed-new", 40, b"x")).unwrap();
        store
            .mark_pushed(&["pushed-old".to_string(), "pushed-new".to_string()])
            .unwrap();

        assert_eq!(store.prune_pushed_before(&doc, 30).unwrap(), 1);

        let remaining = store.ops_since(&doc, Timestamp::MIN).unwrap();
        assert_eq!(ids(&remaining), ["unpushed-old", "pushed-new"]);
    }

    #[test]
    fn test_clear_ops() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = DocumentId::new();
        store.append_op(&op(doc, "a", 1, b"x")).unwrap();
        store.append_op(&op(doc, "b", 2, b"x")).unwrap();

        assert_eq!(store.clear_ops(&doc).unwrap(), 2);
        assert!(!store.has_unpushed(&doc).unwrap());
    }
}
