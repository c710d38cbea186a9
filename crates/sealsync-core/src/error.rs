//! Engine-level errors
//!
//! Wraps the error of whichever collaborator failed. Storage failures are
//! fatal to the operation that hit them; remote failures leave local state
//! intact and are retried on the next trigger.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::document::DocumentError;
use crate::remote::RemoteError;
use crate::storage::StorageError;

/// Errors surfaced by the sync coordinator
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// `change` or `force_sync` called before `initialize`
    #[error("Sync coordinator is not initialized")]
    NotInitialized,

    /// Operation needs a remote channel and none was configured
    #[error("No remote channel configured")]
    NoRemote,
}

impl SyncError {
    /// Whether the failure came from the remote channel
    ///
    /// Network failures never lose local data; callers may continue
    /// local-only.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Remote(_))
    }
}

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_network() {
        assert!(SyncError::from(RemoteError::Closed).is_network());
        assert!(!SyncError::NotInitialized.is_network());
        assert!(!SyncError::from(CryptoError::Encryption).is_network());
    }

    #[test]
    fn test_display_includes_source() {
        let err = SyncError::from(RemoteError::Rejected("quota".into()));
        assert!(err.to_string().contains("quota"));
    }
}
