//! WebSocket relay client
//!
//! One long-lived connection per writer. A writer task drains outgoing
//! frames; a reader task routes responses to their pending request and
//! `published` frames to document subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::message::{ClientMessage, ServerMessage};
use super::{
    PeerDelta, PeerStream, PullResponse, PushAck, RemoteChannel, RemoteError, RemoteOp,
    RemoteResult, RemoteSnapshot,
};
use crate::document_id::DocumentId;
use crate::models::{AuthorId, VersionMarker};

/// Default time to wait for the relay to answer
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;
type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<PeerDelta>>>>>;

/// [`RemoteChannel`] over a WebSocket connection to a relay
pub struct WsRemoteChannel {
    url: String,
    author_id: AuthorId,
    relay_id: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    subscribers: Subscribers,
    next_request: AtomicU64,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl WsRemoteChannel {
    /// Connect and complete the handshake
    pub async fn connect(url: &str, author_id: impl Into<AuthorId>) -> RemoteResult<Self> {
        Self::connect_with_timeout(url, author_id, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        url: &str,
        author_id: impl Into<AuthorId>,
        request_timeout: Duration,
    ) -> RemoteResult<Self> {
        let author_id = author_id.into();
        debug!("Connecting to relay at {}", url);

        let (ws_stream, _response) = tokio::time::timeout(request_timeout, connect_async(url))
            .await
            .map_err(|_| RemoteError::Timeout(request_timeout))?
            .map_err(|e| RemoteError::Unavailable(format!("{}: {}", url, e)))?;

        let (mut write, mut read) = ws_stream.split();
        write
            .send(Message::Binary(ClientMessage::join(&author_id).encode()?))
            .await?;

        let relay_id = tokio::time::timeout(request_timeout, wait_for_peer(&mut read))
            .await
            .map_err(|_| RemoteError::Timeout(request_timeout))??;
        info!("Connected to relay {} at {}", relay_id, url);

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            write.close().await.ok();
        });

        let pending: Pending = Arc::default();
        let subscribers: Subscribers = Arc::default();
        let reader = tokio::spawn(read_loop(read, pending.clone(), subscribers.clone()));

        Ok(Self {
            url: url.to_string(),
            author_id,
            relay_id,
            outgoing,
            pending,
            subscribers,
            next_request: AtomicU64::new(1),
            request_timeout,
            tasks: vec![writer, reader],
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn author_id(&self) -> &AuthorId {
        &self.author_id
    }

    /// Id the relay announced during the handshake
    pub fn relay_id(&self) -> &str {
        &self.relay_id
    }

    async fn request<F>(&self, build: F) -> RemoteResult<ServerMessage>
    where
        F: FnOnce(u64) -> ClientMessage,
    {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = build(request_id).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if self.outgoing.send(Message::Binary(frame)).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(RemoteError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(RemoteError::Timeout(self.request_timeout))
            }
            Ok(Err(_)) => Err(RemoteError::Closed),
            Ok(Ok(ServerMessage::Error { message, .. })) => Err(RemoteError::Rejected(message)),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

impl Drop for WsRemoteChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn unexpected(expected: &str, got: &ServerMessage) -> RemoteError {
    RemoteError::Protocol(format!("expected {} response, got {:?}", expected, got))
}

#[async_trait]
impl RemoteChannel for WsRemoteChannel {
    async fn pull_updates(
        &self,
        document_id: &DocumentId,
        since: &VersionMarker,
        has_unpushed_local: bool,
    ) -> RemoteResult<PullResponse> {
        let response = self
            .request(|id| ClientMessage::pull_updates(id, document_id, since, has_unpushed_local))
            .await?;
        match response {
            ServerMessage::Updates { response, .. } => Ok(response),
            other => Err(unexpected("updates", &other)),
        }
    }

    async fn pull_snapshot(&self, document_id: &DocumentId) -> RemoteResult<Option<RemoteSnapshot>> {
        let response = self
            .request(|id| ClientMessage::pull_snapshot(id, document_id))
            .await?;
        match response {
            ServerMessage::Snapshot { snapshot, .. } => Ok(snapshot),
            other => Err(unexpected("snapshot", &other)),
        }
    }

    async fn push_ops(&self, document_id: &DocumentId, ops: Vec<RemoteOp>) -> RemoteResult<PushAck> {
        let response = self
            .request(|id| ClientMessage::push_ops(id, document_id, ops))
            .await?;
        match response {
            ServerMessage::Accepted { accepted_ids, .. } => Ok(PushAck { accepted_ids }),
            other => Err(unexpected("accepted", &other)),
        }
    }

    async fn push_snapshot(
        &self,
        document_id: &DocumentId,
        snapshot: RemoteSnapshot,
    ) -> RemoteResult<()> {
        let response = self
            .request(|id| ClientMessage::push_snapshot(id, document_id, snapshot))
            .await?;
        match response {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    async fn subscribe(&self, document_id: &DocumentId) -> RemoteResult<PeerStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = document_id.to_bs58check();
        self.subscribers
            .lock()
            .entry(key.clone())
            .or_default()
            .push(tx.clone());

        let response = self
            .request(|id| ClientMessage::subscribe(id, document_id))
            .await;
        match response {
            Ok(ServerMessage::Ack { .. }) => {}
            Ok(other) => {
                unsubscribe(&self.subscribers, &key, &tx);
                return Err(unexpected("ack", &other));
            }
            Err(e) => {
                unsubscribe(&self.subscribers, &key, &tx);
                return Err(e);
            }
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delta| (delta, rx))
        })
        .boxed())
    }
}

async fn wait_for_peer(
    read: &mut SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
) -> RemoteResult<String> {
    loop {
        match read.next().await {
            Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                Ok(ServerMessage::Peer { sender_id, .. }) => return Ok(sender_id),
                Ok(ServerMessage::Error { message, .. }) => {
                    return Err(RemoteError::Rejected(message))
                }
                Ok(_) => {
                    // Ignore other messages during handshake
                }
                Err(e) => warn!("Failed to decode relay frame: {}", e),
            },
            Some(Ok(Message::Close(_))) | None => return Err(RemoteError::Closed),
            Some(Err(e)) => return Err(e.into()),
            _ => {}
        }
    }
}

/// Drop one subscriber, leaving other streams of the document live
fn unsubscribe(subscribers: &Subscribers, key: &str, tx: &mpsc::UnboundedSender<PeerDelta>) {
    let mut subscribers = subscribers.lock();
    if let Some(senders) = subscribers.get_mut(key) {
        senders.retain(|other| !other.same_channel(tx));
        if senders.is_empty() {
            subscribers.remove(key);
        }
    }
}

async fn read_loop(
    mut read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    pending: Pending,
    subscribers: Subscribers,
) {
    while let Some(frame) = read.next().await {
        let data = match frame {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Relay connection error: {}", e);
                break;
            }
        };

        let message = match ServerMessage::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to decode relay frame: {}", e);
                continue;
            }
        };

        match message {
            ServerMessage::Published {
                document_id,
                author_id,
                ciphertext,
            } => {
                let mut subscribers = subscribers.lock();
                if let Some(senders) = subscribers.get_mut(&document_id) {
                    let delta = PeerDelta {
                        author_id,
                        ciphertext,
                    };
                    senders.retain(|tx| tx.send(delta.clone()).is_ok());
                }
            }
            other => match other.request_id() {
                Some(id) => {
                    if let Some(tx) = pending.lock().remove(&id) {
                        let _ = tx.send(other);
                    } else {
                        debug!("Dropping response for unknown request {}", id);
                    }
                }
                None => debug!("Ignoring unsolicited relay frame: {:?}", other),
            },
        }
    }

    debug!("Relay connection closed");
    // Fail outstanding requests and end subscriber streams
    pending.lock().clear();
    subscribers.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimal relay: accepts everything, echoes pushes back as published
    async fn spawn_relay(reject_pushes: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            while let Some(Ok(frame)) = ws.next().await {
                let Message::Binary(data) = frame else {
                    continue;
                };
                let replies = match ClientMessage::decode(&data).unwrap() {
                    ClientMessage::Join { .. } => vec![ServerMessage::Peer {
                        sender_id: "test-relay".to_string(),
                        selected_protocol_version: "1".to_string(),
                    }],
                    ClientMessage::PushOps { request_id, .. } if reject_pushes => {
                        vec![ServerMessage::Error {
                            request_id: Some(request_id),
                            message: "quota exceeded".to_string(),
                        }]
                    }
                    ClientMessage::PushOps {
                        request_id,
                        document_id,
                        ops,
                    } => {
                        let mut replies: Vec<ServerMessage> = ops
                            .iter()
                            .map(|op| ServerMessage::Published {
                                document_id: document_id.clone(),
                                author_id: "writer-a".to_string(),
                                ciphertext: op.ciphertext.clone(),
                            })
                            .collect();
                        replies.push(ServerMessage::Accepted {
                            request_id,
                            accepted_ids: ops.into_iter().map(|op| op.id).collect(),
                        });
                        replies
                    }
                    ClientMessage::PullUpdates { request_id, .. } => vec![ServerMessage::Updates {
                        request_id,
                        response: PullResponse::UseSnapshot {
                            snapshot_version: 2,
                        },
                    }],
                    ClientMessage::PullSnapshot { request_id, .. } => {
                        vec![ServerMessage::Snapshot {
                            request_id,
                            snapshot: Some(RemoteSnapshot {
                                ciphertext: vec![5, 5],
                                version_marker: VersionMarker::new(vec![1; 32]),
                            }),
                        }]
                    }
                    ClientMessage::PushSnapshot { request_id, .. }
                    | ClientMessage::Subscribe { request_id, .. } => {
                        vec![ServerMessage::Ack { request_id }]
                    }
                };
                for reply in replies {
                    ws.send(Message::Binary(reply.encode().unwrap()))
                        .await
                        .unwrap();
                }
            }
        });

        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let url = spawn_relay(false).await;
        let channel = WsRemoteChannel::connect(&url, "writer-a").await.unwrap();

        assert_eq!(channel.relay_id(), "test-relay");
        assert_eq!(channel.author_id(), "writer-a");
    }

    #[tokio::test]
    async fn test_push_and_receive_published() {
        let url = spawn_relay(false).await;
        let channel = WsRemoteChannel::connect(&url, "writer-a").await.unwrap();
        let doc = DocumentId::new();

        let mut deltas = channel.subscribe(&doc).await.unwrap();
        let ack = channel
            .push_ops(
                &doc,
                vec![RemoteOp {
                    id: "op-1".to_string(),
                    ciphertext: vec![1, 2, 3],
                    version_marker: VersionMarker::new(vec![7; 32]),
                }],
            )
            .await
            .unwrap();

        assert_eq!(ack.accepted_ids, vec!["op-1"]);
        let delta = deltas.next().await.unwrap();
        assert_eq!(delta.author_id, "writer-a");
        assert_eq!(delta.ciphertext, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_pull_calls() {
        let url = spawn_relay(false).await;
        let channel = WsRemoteChannel::connect(&url, "writer-a").await.unwrap();
        let doc = DocumentId::new();

        let response = channel
            .pull_updates(&doc, &VersionMarker::empty(), true)
            .await
            .unwrap();
        assert_eq!(
            response,
            PullResponse::UseSnapshot {
                snapshot_version: 2
            }
        );

        let snapshot = channel.pull_snapshot(&doc).await.unwrap().unwrap();
        assert_eq!(snapshot.ciphertext, vec![5, 5]);

        channel
            .push_snapshot(&doc, snapshot)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_error_is_rejected() {
        let url = spawn_relay(true).await;
        let channel = WsRemoteChannel::connect(&url, "writer-a").await.unwrap();

        let err = channel
            .push_ops(&DocumentId::new(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(ref m) if m == "quota exceeded"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WsRemoteChannel::connect(&format!("ws://{}", addr), "writer-a").await;
        assert!(matches!(result, Err(RemoteError::Unavailable(_))));
    }

    #[test]
    fn test_unsubscribe_keeps_other_streams() {
        let subscribers: Subscribers = Arc::default();
        let (live, mut live_rx) = mpsc::unbounded_channel();
        let (failed, _failed_rx) = mpsc::unbounded_channel();
        subscribers
            .lock()
            .entry("doc".to_string())
            .or_default()
            .extend([live.clone(), failed.clone()]);

        unsubscribe(&subscribers, "doc", &failed);
        {
            let subscribers = subscribers.lock();
            let senders = subscribers.get("doc").unwrap();
            assert_eq!(senders.len(), 1);
            assert!(senders[0].same_channel(&live));
        }

        live.send(PeerDelta {
            author_id: "writer-b".into(),
            ciphertext: vec![1],
        })
        .unwrap();
        assert_eq!(live_rx.try_recv().unwrap().ciphertext, vec![1]);

        unsubscribe(&subscribers, "doc", &live);
        assert!(subscribers.lock().get("doc").is_none());
    }
}
