//! In-process relay
//!
//! Holds ciphertext per document the way a hosted relay would: an ordered
//! op stream, at most one snapshot, and a set of realtime subscribers.
//! Every connected writer gets a [`MemoryChannel`] bound to its author id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    PeerDelta, PeerStream, PullResponse, PushAck, RemoteChannel, RemoteError, RemoteOp,
    RemoteResult, RemoteSnapshot,
};
use crate::document_id::DocumentId;
use crate::models::{AuthorId, VersionMarker};

/// Call counters, useful for asserting on sync behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub pull_updates: usize,
    pub pull_snapshot: usize,
    pub push_ops: usize,
    pub push_snapshot: usize,
    pub subscribe: usize,
    /// `has_unpushed_local` flag of the most recent pull
    pub last_pull_had_unpushed: Option<bool>,
}

struct StoredOp {
    seq: u64,
    op: RemoteOp,
}

struct StoredSnapshot {
    snapshot: RemoteSnapshot,
    covers_seq: u64,
}

#[derive(Default)]
struct RelayDocument {
    ops: Vec<StoredOp>,
    op_ids: HashSet<String>,
    snapshot: Option<StoredSnapshot>,
    snapshot_version: u64,
    subscribers: Vec<mpsc::UnboundedSender<PeerDelta>>,
}

impl RelayDocument {
    fn last_seq(&self) -> u64 {
        self.ops.last().map(|s| s.seq).unwrap_or(0)
    }

    /// Stream position matching a client's version marker
    fn position_of(&self, since: &VersionMarker) -> Option<u64> {
        if let Some(stored) = &self.snapshot {
            if &stored.snapshot.version_marker == since {
                return Some(stored.covers_seq);
            }
        }
        self.ops
            .iter()
            .rev()
            .find(|s| &s.op.version_marker == since)
            .map(|s| s.seq)
    }

    fn publish(&mut self, delta: PeerDelta) {
        self.subscribers
            .retain(|tx| tx.send(delta.clone()).is_ok());
    }
}

#[derive(Default)]
struct RelayState {
    documents: HashMap<DocumentId, RelayDocument>,
    offline: bool,
    accept_limit: Option<usize>,
    replay_limit: Option<usize>,
    reject_snapshots: bool,
    stats: RelayStats,
}

impl RelayState {
    fn check_online(&self) -> RemoteResult<()> {
        if self.offline {
            Err(RemoteError::Unavailable("relay is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Shared in-memory relay
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer pulls with `useSnapshot` once more than `limit` ops would be
    /// replayed and a snapshot is available
    pub fn with_replay_limit(self, limit: usize) -> Self {
        self.state.lock().replay_limit = Some(limit);
        self
    }

    /// Connect a writer
    pub fn channel(&self, author_id: impl Into<AuthorId>) -> MemoryChannel {
        MemoryChannel {
            relay: self.clone(),
            author_id: author_id.into(),
        }
    }

    /// Simulate losing (or regaining) the network
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Accept at most `limit` ops from each push batch
    pub fn set_accept_limit(&self, limit: Option<usize>) {
        self.state.lock().accept_limit = limit;
    }

    /// Refuse snapshot uploads while still serving everything else
    pub fn set_reject_snapshots(&self, reject: bool) {
        self.state.lock().reject_snapshots = reject;
    }

    pub fn stats(&self) -> RelayStats {
        self.state.lock().stats.clone()
    }

    /// Ops stored for a document, in stream order
    pub fn ops(&self, document_id: &DocumentId) -> Vec<RemoteOp> {
        self.state
            .lock()
            .documents
            .get(document_id)
            .map(|d| d.ops.iter().map(|s| s.op.clone()).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, document_id: &DocumentId) -> Option<RemoteSnapshot> {
        self.state
            .lock()
            .documents
            .get(document_id)
            .and_then(|d| d.snapshot.as_ref().map(|s| s.snapshot.clone()))
    }

    pub fn snapshot_version(&self, document_id: &DocumentId) -> u64 {
        self.state
            .lock()
            .documents
            .get(document_id)
            .map(|d| d.snapshot_version)
            .unwrap_or(0)
    }

    /// Deliver a delta to every subscriber of a document
    pub fn publish(&self, document_id: &DocumentId, delta: PeerDelta) {
        let mut state = self.state.lock();
        state
            .documents
            .entry(*document_id)
            .or_default()
            .publish(delta);
    }

    fn pull_updates(
        &self,
        document_id: &DocumentId,
        since: &VersionMarker,
        has_unpushed_local: bool,
    ) -> RemoteResult<PullResponse> {
        let mut state = self.state.lock();
        state.check_online()?;
        state.stats.pull_updates += 1;
        state.stats.last_pull_had_unpushed = Some(has_unpushed_local);
        let replay_limit = state.replay_limit;

        let doc = state.documents.entry(*document_id).or_default();
        let use_snapshot = PullResponse::UseSnapshot {
            snapshot_version: doc.snapshot_version,
        };

        let position = if since.is_empty() {
            None
        } else {
            doc.position_of(since)
        };

        let start = match position {
            Some(seq) => seq,
            None if doc.snapshot.is_some() => return Ok(use_snapshot),
            None => 0,
        };

        let ops: Vec<RemoteOp> = doc
            .ops
            .iter()
            .filter(|s| s.seq > start)
            .map(|s| s.op.clone())
            .collect();

        if let Some(limit) = replay_limit {
            if ops.len() > limit && doc.snapshot.is_some() {
                return Ok(use_snapshot);
            }
        }

        Ok(PullResponse::Ops { ops })
    }

    fn pull_snapshot(&self, document_id: &DocumentId) -> RemoteResult<Option<RemoteSnapshot>> {
        let mut state = self.state.lock();
        state.check_online()?;
        state.stats.pull_snapshot += 1;
        Ok(state
            .documents
            .get(document_id)
            .and_then(|d| d.snapshot.as_ref().map(|s| s.snapshot.clone())))
    }

    fn push_ops(
        &self,
        author_id: &AuthorId,
        document_id: &DocumentId,
        ops: Vec<RemoteOp>,
    ) -> RemoteResult<PushAck> {
        let mut state = self.state.lock();
        state.check_online()?;
        state.stats.push_ops += 1;
        let take = state.accept_limit.unwrap_or(usize::MAX);

        let doc = state.documents.entry(*document_id).or_default();
        let mut accepted_ids = Vec::new();
        for op in ops.into_iter().take(take) {
            accepted_ids.push(op.id.clone());
            if !doc.op_ids.insert(op.id.clone()) {
                continue;
            }
            let seq = doc.last_seq() + 1;
            doc.publish(PeerDelta {
                author_id: author_id.clone(),
                ciphertext: op.ciphertext.clone(),
            });
            doc.ops.push(StoredOp { seq, op });
        }

        debug!(
            "Relay accepted {} ops for {} from {}",
            accepted_ids.len(),
            document_id,
            author_id
        );
        Ok(PushAck { accepted_ids })
    }

    fn push_snapshot(&self, document_id: &DocumentId, snapshot: RemoteSnapshot) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.check_online()?;
        state.stats.push_snapshot += 1;
        if state.reject_snapshots {
            return Err(RemoteError::Rejected("snapshot uploads disabled".to_string()));
        }

        let doc = state.documents.entry(*document_id).or_default();
        let covers_seq = doc.last_seq();
        doc.snapshot = Some(StoredSnapshot {
            snapshot,
            covers_seq,
        });
        doc.snapshot_version += 1;
        Ok(())
    }

    fn subscribe(&self, document_id: &DocumentId) -> RemoteResult<PeerStream> {
        let mut state = self.state.lock();
        state.check_online()?;
        state.stats.subscribe += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        state
            .documents
            .entry(*document_id)
            .or_default()
            .subscribers
            .push(tx);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delta| (delta, rx))
        })
        .boxed())
    }
}

/// One writer's connection to a [`MemoryRelay`]
#[derive(Clone)]
pub struct MemoryChannel {
    relay: MemoryRelay,
    author_id: AuthorId,
}

impl MemoryChannel {
    pub fn author_id(&self) -> &AuthorId {
        &self.author_id
    }

    pub fn relay(&self) -> &MemoryRelay {
        &self.relay
    }
}

#[async_trait]
impl RemoteChannel for MemoryChannel {
    async fn pull_updates(
        &self,
        document_id: &DocumentId,
        since: &VersionMarker,
        has_unpushed_local: bool,
    ) -> RemoteResult<PullResponse> {
        self.relay
            .pull_updates(document_id, since, has_unpushed_local)
    }

    async fn pull_snapshot(&self, document_id: &DocumentId) -> RemoteResult<Option<RemoteSnapshot>> {
        self.relay.pull_snapshot(document_id)
    }

    async fn push_ops(&self, document_id: &DocumentId, ops: Vec<RemoteOp>) -> RemoteResult<PushAck> {
        self.relay.push_ops(&self.author_id, document_id, ops)
    }

    async fn push_snapshot(
        &self,
        document_id: &DocumentId,
        snapshot: RemoteSnapshot,
    ) -> RemoteResult<()> {
        self.relay.push_snapshot(document_id, snapshot)
    }

    async fn subscribe(&self, document_id: &DocumentId) -> RemoteResult<PeerStream> {
        self.relay.subscribe(document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: &str, marker: u8) -> RemoteOp {
        RemoteOp {
            id: id.to_string(),
            ciphertext: vec![marker; 4],
            version_marker: VersionMarker::new(vec![marker]),
        }
    }

    #[tokio::test]
    async fn test_push_then_pull_from_start() {
        let relay = MemoryRelay::new();
        let alice = relay.channel("alice");
        let doc = DocumentId::new();

        let ack = alice
            .push_ops(&doc, vec![op("a", 1), op("b", 2)])
            .await
            .unwrap();
        assert_eq!(ack.accepted_ids, vec!["a", "b"]);

        let bob = relay.channel("bob");
        let response = bob
            .pull_updates(&doc, &VersionMarker::empty(), false)
            .await
            .unwrap();
        assert_eq!(
            response,
            PullResponse::Ops {
                ops: vec![op("a", 1), op("b", 2)]
            }
        );
    }

    #[tokio::test]
    async fn test_pull_since_known_marker() {
        let relay = MemoryRelay::new();
        let alice = relay.channel("alice");
        let doc = DocumentId::new();
        alice
            .push_ops(&doc, vec![op("a", 1), op("b", 2), op("c", 3)])
            .await
            .unwrap();

        let response = alice
            .pull_updates(&doc, &VersionMarker::new(vec![2]), true)
            .await
            .unwrap();
        assert_eq!(response, PullResponse::Ops { ops: vec![op("c", 3)] });
        assert_eq!(relay.stats().last_pull_had_unpushed, Some(true));
    }

    #[tokio::test]
    async fn test_duplicate_push_is_acknowledged_once_stored() {
        let relay = MemoryRelay::new();
        let alice = relay.channel("alice");
        let doc = DocumentId::new();

        alice.push_ops(&doc, vec![op("a", 1)]).await.unwrap();
        let ack = alice.push_ops(&doc, vec![op("a", 1)]).await.unwrap();

        assert_eq!(ack.accepted_ids, vec!["a"]);
        assert_eq!(relay.ops(&doc).len(), 1);
    }

    #[tokio::test]
    async fn test_accept_limit_truncates_batch() {
        let relay = MemoryRelay::new();
        relay.set_accept_limit(Some(3));
        let alice = relay.channel("alice");
        let doc = DocumentId::new();

        let batch = (1..=5).map(|i| op(&format!("op-{}", i), i)).collect();
        let ack = alice.push_ops(&doc, batch).await.unwrap();
        assert_eq!(ack.accepted_ids, vec!["op-1", "op-2", "op-3"]);
    }

    #[tokio::test]
    async fn test_unknown_marker_with_snapshot_uses_snapshot() {
        let relay = MemoryRelay::new();
        let alice = relay.channel("alice");
        let doc = DocumentId::new();

        alice.push_ops(&doc, vec![op("a", 1)]).await.unwrap();
        alice
            .push_snapshot(
                &doc,
                RemoteSnapshot {
                    ciphertext: vec![7],
                    version_marker: VersionMarker::new(vec![1]),
                },
            )
            .await
            .unwrap();

        let response = alice
            .pull_updates(&doc, &VersionMarker::new(vec![99]), false)
            .await
            .unwrap();
        assert_eq!(
            response,
            PullResponse::UseSnapshot {
                snapshot_version: 1
            }
        );

        // Pulling from the snapshot marker resumes after the covered ops
        let response = alice
            .pull_updates(&doc, &VersionMarker::new(vec![1]), false)
            .await
            .unwrap();
        assert_eq!(response, PullResponse::Ops { ops: vec![] });
    }

    #[tokio::test]
    async fn test_replay_limit_triggers_snapshot() {
        let relay = MemoryRelay::new().with_replay_limit(2);
        let alice = relay.channel("alice");
        let doc = DocumentId::new();

        alice
            .push_ops(&doc, vec![op("a", 1), op("b", 2), op("c", 3)])
            .await
            .unwrap();

        // No snapshot yet: the full stream is still served
        let response = alice
            .pull_updates(&doc, &VersionMarker::empty(), false)
            .await
            .unwrap();
        assert!(matches!(response, PullResponse::Ops { ref ops } if ops.len() == 3));

        alice
            .push_snapshot(
                &doc,
                RemoteSnapshot {
                    ciphertext: vec![1],
                    version_marker: VersionMarker::new(vec![3]),
                },
            )
            .await
            .unwrap();
        let response = alice
            .pull_updates(&doc, &VersionMarker::empty(), false)
            .await
            .unwrap();
        assert!(matches!(response, PullResponse::UseSnapshot { .. }));
    }

    #[tokio::test]
    async fn test_subscribers_receive_every_author() {
        let relay = MemoryRelay::new();
        let alice = relay.channel("alice");
        let bob = relay.channel("bob");
        let doc = DocumentId::new();

        let mut stream = bob.subscribe(&doc).await.unwrap();
        alice.push_ops(&doc, vec![op("a", 1)]).await.unwrap();
        bob.push_ops(&doc, vec![op("b", 2)]).await.unwrap();

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.author_id, "alice");
        assert_eq!(second.author_id, "bob");
    }

    #[tokio::test]
    async fn test_offline_relay_fails_every_call() {
        let relay = MemoryRelay::new();
        let alice = relay.channel("alice");
        let doc = DocumentId::new();
        relay.set_offline(true);

        assert!(matches!(
            alice.push_ops(&doc, vec![op("a", 1)]).await,
            Err(RemoteError::Unavailable(_))
        ));
        assert!(alice.pull_snapshot(&doc).await.is_err());
        assert!(alice.subscribe(&doc).await.is_err());

        relay.set_offline(false);
        assert!(alice.push_ops(&doc, vec![op("a", 1)]).await.is_ok());
    }
}
