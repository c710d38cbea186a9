//! Remote channel
//!
//! The coordinator talks to the relay only through [`RemoteChannel`]:
//! four request/response calls plus a realtime subscription of
//! peer-originated deltas. Payloads are already encrypted when they get
//! here; the relay never sees plaintext.
//!
//! Two implementations ship with the crate:
//! - [`MemoryRelay`]: in-process relay, used by tests and single-host setups
//! - [`WsRemoteChannel`]: WebSocket client speaking CBOR frames

mod memory;
mod message;
mod ws;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document_id::DocumentId;
use crate::models::{AuthorId, Op, OpId, VersionMarker};

pub use memory::{MemoryChannel, MemoryRelay, RelayStats};
pub use message::{ClientMessage, ServerMessage, PROTOCOL_V1};
pub use ws::WsRemoteChannel;

/// Errors from the relay or the path to it
///
/// All of these are recoverable from the engine's point of view: ops stay
/// unpushed and the next trigger retries.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    #[error("Relay rejected request: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection to relay closed")]
    Closed,

    #[error("Timed out after {0:?} waiting for relay")]
    Timeout(Duration),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// An op as shipped to and from the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOp {
    pub id: OpId,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub version_marker: VersionMarker,
}

impl From<&Op> for RemoteOp {
    fn from(op: &Op) -> Self {
        Self {
            id: op.id.clone(),
            ciphertext: op.ciphertext.clone(),
            version_marker: op.version_marker.clone(),
        }
    }
}

/// A snapshot as shipped to and from the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub version_marker: VersionMarker,
}

/// Answer to a pull: either the missing ops, or "fetch the snapshot"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PullResponse {
    /// Ordered ops the caller has not seen
    #[serde(rename = "ops")]
    Ops { ops: Vec<RemoteOp> },

    /// Too much divergence; load the latest snapshot instead
    #[serde(rename = "useSnapshot")]
    UseSnapshot {
        #[serde(rename = "snapshotVersion")]
        snapshot_version: u64,
    },
}

/// Acknowledgement of a pushed batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    pub accepted_ids: Vec<OpId>,
}

/// A delta published by some writer on the realtime channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDelta {
    pub author_id: AuthorId,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Stream of peer deltas; dropping it unsubscribes
pub type PeerStream = BoxStream<'static, PeerDelta>;

/// Transport contract consumed by the sync coordinator
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Ops since `since`, or an instruction to fall back to the snapshot
    async fn pull_updates(
        &self,
        document_id: &DocumentId,
        since: &VersionMarker,
        has_unpushed_local: bool,
    ) -> RemoteResult<PullResponse>;

    /// Latest snapshot held by the relay
    async fn pull_snapshot(&self, document_id: &DocumentId) -> RemoteResult<Option<RemoteSnapshot>>;

    /// Submit a batch; only the returned ids count as delivered
    async fn push_ops(&self, document_id: &DocumentId, ops: Vec<RemoteOp>) -> RemoteResult<PushAck>;

    async fn push_snapshot(
        &self,
        document_id: &DocumentId,
        snapshot: RemoteSnapshot,
    ) -> RemoteResult<()>;

    /// Realtime deltas for a document, from every author
    async fn subscribe(&self, document_id: &DocumentId) -> RemoteResult<PeerStream>;
}
