//! Coordinator status and events

use std::fmt;

use serde::Serialize;

/// Sync status, exposed for UI indication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Nothing in flight
    Idle,
    /// Network round-trip in flight
    Syncing,
    /// Local change durably written, push not yet fired
    Saving,
    /// Last operation failed; the next trigger retries
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Saving => "saving",
            SyncStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Events emitted by the sync coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Status changed
    StatusChanged(SyncStatus),
    /// A peer delta was applied to the document
    RemoteUpdate,
    /// Error occurred
    Error(String),
    /// Terminating with changes the relay has not acknowledged
    UnsavedChanges,
}

/// Host lifecycle signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// About to be hidden or backgrounded
    Hidden,
    /// About to terminate
    Terminating,
}
