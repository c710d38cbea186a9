//! Automerge-backed document
//!
//! Stores string values in the root map of an [`AutoCommit`] document.
//! Deltas are automerge change chunks, snapshots are `save()` output, and
//! the version marker is the concatenation of the current heads.

use automerge::{transaction::Transactable, AutoCommit, AutomergeError, ChangeHash, ReadDoc, ROOT};

use super::{DocumentError, ListenerId, LocalChange, LocalChangeListener, SyncDocument};
use crate::models::VersionMarker;

const HASH_LEN: usize = 32;

/// A key/value document backed by Automerge
pub struct AutomergeDocument {
    doc: AutoCommit,
    /// Heads already reported to listeners
    emitted_heads: Vec<ChangeHash>,
    listeners: Vec<(ListenerId, LocalChangeListener)>,
    next_listener: u64,
}

impl AutomergeDocument {
    /// Create a new empty document
    pub fn new() -> Self {
        Self::from_doc(AutoCommit::new())
    }

    /// Load a document from `save()` bytes
    pub fn load(bytes: &[u8]) -> Result<Self, DocumentError> {
        Ok(Self::from_doc(AutoCommit::load(bytes)?))
    }

    fn from_doc(mut doc: AutoCommit) -> Self {
        let emitted_heads = doc.get_heads();
        Self {
            doc,
            emitted_heads,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    /// Run a mutation and report the resulting delta to listeners
    pub fn change<F, T>(&mut self, f: F) -> Result<T, DocumentError>
    where
        F: FnOnce(&mut AutoCommit) -> Result<T, AutomergeError>,
    {
        let result = f(&mut self.doc)?;
        self.emit_pending();
        Ok(result)
    }

    /// Set a string value
    pub fn put(&mut self, key: &str, value: &str) -> Result<(), DocumentError> {
        self.change(|doc| doc.put(ROOT, key, value))
    }

    /// Remove a key
    pub fn delete(&mut self, key: &str) -> Result<(), DocumentError> {
        self.change(|doc| doc.delete(ROOT, key))
    }

    /// Read a string value
    pub fn get(&self, key: &str) -> Result<Option<String>, DocumentError> {
        match self.doc.get(ROOT, key)? {
            Some((value, _)) => value
                .to_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| DocumentError::InvalidType(key.to_string())),
            None => Ok(None),
        }
    }

    /// All string entries, sorted by key
    pub fn entries(&self) -> Result<Vec<(String, String)>, DocumentError> {
        let mut entries = Vec::new();
        for key in self.doc.keys(ROOT) {
            if let Some(value) = self.get(&key)? {
                entries.push((key, value));
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Underlying Automerge document
    pub fn inner(&self) -> &AutoCommit {
        &self.doc
    }

    /// Report changes not yet seen by listeners, if any
    fn emit_pending(&mut self) {
        let heads = self.doc.get_heads();
        if heads == self.emitted_heads {
            return;
        }

        let delta = self.doc.save_after(&self.emitted_heads);
        self.emitted_heads = heads;

        if delta.is_empty() || self.listeners.is_empty() {
            return;
        }

        let change = LocalChange {
            delta,
            version: encode_heads(&self.emitted_heads),
        };
        for (_, listener) in &self.listeners {
            listener(&change);
        }
    }
}

impl Default for AutomergeDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncDocument for AutomergeDocument {
    fn subscribe_local_changes(&mut self, listener: LocalChangeListener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    fn unsubscribe_local_changes(&mut self, id: ListenerId) {
        self.listeners.retain(|(existing, _)| *existing != id);
    }

    fn apply_delta(&mut self, delta: &[u8]) -> Result<(), DocumentError> {
        self.doc.load_incremental(delta)?;
        self.emit_pending();
        Ok(())
    }

    fn apply_snapshot(&mut self, snapshot: &[u8]) -> Result<(), DocumentError> {
        // A saved document is a valid incremental chunk; merging it keeps
        // any local changes the snapshot does not contain.
        self.apply_delta(snapshot)
    }

    fn export_delta_since(&mut self, since: &VersionMarker) -> Result<Vec<u8>, DocumentError> {
        let heads = decode_heads(since)?;
        Ok(self.doc.save_after(&heads))
    }

    /// Compressed `save()` of the whole document, history included, so
    /// peers can still merge deltas made against older heads
    fn export_snapshot(&mut self) -> Result<Vec<u8>, DocumentError> {
        Ok(self.doc.save())
    }

    fn current_version_marker(&mut self) -> VersionMarker {
        encode_heads(&self.doc.get_heads())
    }
}

fn encode_heads(heads: &[ChangeHash]) -> VersionMarker {
    let mut bytes = Vec::with_capacity(heads.len() * HASH_LEN);
    for head in heads {
        bytes.extend_from_slice(&head.0);
    }
    VersionMarker::new(bytes)
}

fn decode_heads(marker: &VersionMarker) -> Result<Vec<ChangeHash>, DocumentError> {
    let bytes = marker.as_bytes();
    if bytes.len() % HASH_LEN != 0 {
        return Err(DocumentError::InvalidVersionMarker(format!(
            "length {} is not a multiple of {}",
            bytes.len(),
            HASH_LEN
        )));
    }

    bytes
        .chunks(HASH_LEN)
        .map(|chunk| {
            let hash: [u8; HASH_LEN] = chunk
                .try_into()
                .map_err(|_| DocumentError::InvalidVersionMarker("short hash".to_string()))?;
            Ok(ChangeHash(hash))
        })
        .collect()
}
