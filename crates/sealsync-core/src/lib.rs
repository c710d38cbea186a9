//! sealsync core library
//!
//! An offline-first, end-to-end encrypted sync engine for mergeable
//! documents. Every local edit is encrypted and written to a durable op log
//! before anything touches the network; a relay only ever sees ciphertext.
//!
//! # Architecture
//!
//! - **Document**: any [`SyncDocument`] (an automerge-backed one ships in
//!   [`document`]) owns merging; the engine only moves its deltas around
//! - **Storage**: SQLite op log, snapshot store and sync cursors
//! - **Remote**: [`RemoteChannel`] to a relay, over WebSocket or in-process
//! - **Sync**: [`SyncCoordinator`] drives bootstrap, throttled pushes, peer
//!   deltas and compaction
//!
//! # Quick Start
//!
//! ```text
//! let store = LocalStore::open(&config.database_path())?;
//! let cipher = Arc::new(AesGcmCipher::new(&key));
//! let coordinator = SyncCoordinator::builder(doc_id, AutomergeDocument::new(), store, cipher, "laptop")
//!     .with_remote(Arc::new(WsRemoteChannel::connect(url, "laptop").await?))
//!     .build();
//!
//! coordinator.initialize().await?;
//! coordinator.change(|doc| doc.put("title", "hello")).await?;
//! ```
//!
//! # Modules
//!
//! - `sync`: the coordinator (main entry point)
//! - `storage`: durable local state
//! - `remote`: relay channel and wire types
//! - `document`: mergeable document interface
//! - `crypto`: payload encryption
//! - `policy`: snapshot compaction thresholds
//! - `config`: application configuration

pub mod config;
pub mod crypto;
pub mod document;
pub mod document_id;
pub mod error;
pub mod models;
pub mod policy;
pub mod remote;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use crypto::{AesGcmCipher, CryptoError, EncryptionKey, PayloadCipher};
pub use document::{AutomergeDocument, DocumentError, LocalChange, SyncDocument};
pub use document_id::{DocumentId, DocumentIdError};
pub use error::{SyncError, SyncResult};
pub use models::{AuthorId, Op, OpStats, Snapshot, VersionMarker};
pub use policy::SnapshotPolicy;
pub use remote::{MemoryRelay, RemoteChannel, RemoteError, WsRemoteChannel};
pub use storage::{LocalStore, StorageError};
pub use sync::{LifecycleEvent, SyncCoordinator, SyncEvent, SyncStatus};
