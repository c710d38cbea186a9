//! Mergeable document interface
//!
//! The engine never merges anything itself. It drives a document through
//! [`SyncDocument`]: capture local deltas, apply incoming deltas and
//! snapshots, export state, and report a version marker.
//!
//! Applying a delta must be idempotent and order-insensitive. Documents are
//! allowed to (and [`AutomergeDocument`] does) report applied remote deltas
//! on the same local-change stream as genuine local edits.

mod automerge_doc;

use thiserror::Error;

use crate::models::VersionMarker;

pub use automerge_doc::AutomergeDocument;

/// Errors raised by a document collaborator
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Invalid version marker: {0}")]
    InvalidVersionMarker(String),

    #[error("Invalid document value for {0}")]
    InvalidType(String),
}

/// A delta the document produced, with the version it leads to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub delta: Vec<u8>,
    pub version: VersionMarker,
}

/// Callback invoked synchronously for every local change
pub type LocalChangeListener = Box<dyn Fn(&LocalChange) + Send + Sync>;

/// Handle returned by [`SyncDocument::subscribe_local_changes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// The document collaborator consumed by the sync coordinator
///
/// All calls are synchronous; listeners run inside the mutating call.
pub trait SyncDocument: Send + 'static {
    fn subscribe_local_changes(&mut self, listener: LocalChangeListener) -> ListenerId;

    fn unsubscribe_local_changes(&mut self, id: ListenerId);

    fn apply_delta(&mut self, delta: &[u8]) -> Result<(), DocumentError>;

    fn apply_snapshot(&mut self, snapshot: &[u8]) -> Result<(), DocumentError>;

    fn export_delta_since(&mut self, since: &VersionMarker) -> Result<Vec<u8>, DocumentError>;

    /// Self-contained export of the current state that `apply_snapshot`
    /// can load into an empty document
    ///
    /// Implementations may keep history in it; it only has to replace
    /// replaying the ops it covers.
    fn export_snapshot(&mut self) -> Result<Vec<u8>, DocumentError>;

    fn current_version_marker(&mut self) -> VersionMarker;
}
