//! Relay wire protocol
//!
//! CBOR frames exchanged with the relay over a WebSocket. Requests carry a
//! client-chosen `requestId` echoed back in the matching response;
//! `published` frames arrive unsolicited for subscribed documents.

use serde::{Deserialize, Serialize};

use super::{PullResponse, RemoteError, RemoteOp, RemoteResult, RemoteSnapshot};
use crate::document_id::DocumentId;
use crate::models::{AuthorId, OpId, VersionMarker};

/// Protocol version
pub const PROTOCOL_V1: &str = "1";

/// Frames sent to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Handshake
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "senderId")]
        sender_id: AuthorId,
        #[serde(rename = "supportedProtocolVersions")]
        supported_protocol_versions: Vec<String>,
    },

    #[serde(rename = "pullUpdates")]
    PullUpdates {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(rename = "documentId")]
        document_id: String,
        since: VersionMarker,
        #[serde(rename = "hasUnpushedLocal")]
        has_unpushed_local: bool,
    },

    #[serde(rename = "pullSnapshot")]
    PullSnapshot {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(rename = "documentId")]
        document_id: String,
    },

    #[serde(rename = "pushOps")]
    PushOps {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(rename = "documentId")]
        document_id: String,
        ops: Vec<RemoteOp>,
    },

    #[serde(rename = "pushSnapshot")]
    PushSnapshot {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(rename = "documentId")]
        document_id: String,
        snapshot: RemoteSnapshot,
    },

    /// Start receiving `published` frames for a document
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(rename = "documentId")]
        document_id: String,
    },
}

/// Frames received from the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake response
    #[serde(rename = "peer")]
    Peer {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "selectedProtocolVersion")]
        selected_protocol_version: String,
    },

    #[serde(rename = "updates")]
    Updates {
        #[serde(rename = "requestId")]
        request_id: u64,
        response: PullResponse,
    },

    #[serde(rename = "snapshot")]
    Snapshot {
        #[serde(rename = "requestId")]
        request_id: u64,
        snapshot: Option<RemoteSnapshot>,
    },

    #[serde(rename = "accepted")]
    Accepted {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(rename = "acceptedIds")]
        accepted_ids: Vec<OpId>,
    },

    /// Generic success for requests without a payload
    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "requestId")]
        request_id: u64,
    },

    /// Realtime delta from some writer
    #[serde(rename = "published")]
    Published {
        #[serde(rename = "documentId")]
        document_id: String,
        #[serde(rename = "authorId")]
        author_id: AuthorId,
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(rename = "requestId", default)]
        request_id: Option<u64>,
        message: String,
    },
}

impl ClientMessage {
    /// Create a join message
    pub fn join(sender_id: &str) -> Self {
        ClientMessage::Join {
            sender_id: sender_id.to_string(),
            supported_protocol_versions: vec![PROTOCOL_V1.to_string()],
        }
    }

    pub fn pull_updates(
        request_id: u64,
        document_id: &DocumentId,
        since: &VersionMarker,
        has_unpushed_local: bool,
    ) -> Self {
        ClientMessage::PullUpdates {
            request_id,
            document_id: document_id.to_bs58check(),
            since: since.clone(),
            has_unpushed_local,
        }
    }

    pub fn pull_snapshot(request_id: u64, document_id: &DocumentId) -> Self {
        ClientMessage::PullSnapshot {
            request_id,
            document_id: document_id.to_bs58check(),
        }
    }

    pub fn push_ops(request_id: u64, document_id: &DocumentId, ops: Vec<RemoteOp>) -> Self {
        ClientMessage::PushOps {
            request_id,
            document_id: document_id.to_bs58check(),
            ops,
        }
    }

    pub fn push_snapshot(request_id: u64, document_id: &DocumentId, snapshot: RemoteSnapshot) -> Self {
        ClientMessage::PushSnapshot {
            request_id,
            document_id: document_id.to_bs58check(),
            snapshot,
        }
    }

    pub fn subscribe(request_id: u64, document_id: &DocumentId) -> Self {
        ClientMessage::Subscribe {
            request_id,
            document_id: document_id.to_bs58check(),
        }
    }

    /// Request id, if this frame expects a response
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientMessage::Join { .. } => None,
            ClientMessage::PullUpdates { request_id, .. }
            | ClientMessage::PullSnapshot { request_id, .. }
            | ClientMessage::PushOps { request_id, .. }
            | ClientMessage::PushSnapshot { request_id, .. }
            | ClientMessage::Subscribe { request_id, .. } => Some(*request_id),
        }
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> RemoteResult<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> RemoteResult<Self> {
        decode(bytes)
    }
}

impl ServerMessage {
    /// Request this frame answers; `None` for unsolicited frames
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Updates { request_id, .. }
            | ServerMessage::Snapshot { request_id, .. }
            | ServerMessage::Accepted { request_id, .. }
            | ServerMessage::Ack { request_id } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::Peer { .. } | ServerMessage::Published { .. } => None,
        }
    }

    pub fn encode(&self) -> RemoteResult<Vec<u8>> {
        encode(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> RemoteResult<Self> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(message: &T) -> RemoteResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)
        .map_err(|e| RemoteError::Protocol(format!("CBOR encoding failed: {}", e)))?;
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> RemoteResult<T> {
    ciborium::from_reader(bytes)
        .map_err(|e| RemoteError::Protocol(format!("CBOR decoding failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_message_encoding() {
        let msg = ClientMessage::join("writer-123");
        let bytes = msg.encode().unwrap();

        assert!(!bytes.is_empty());
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_push_ops_carries_binary_payloads() {
        let doc_id = DocumentId::new();
        let msg = ClientMessage::push_ops(
            7,
            &doc_id,
            vec![RemoteOp {
                id: "op-1".to_string(),
                ciphertext: vec![0, 255, 1, 254],
                version_marker: VersionMarker::new(vec![9; 32]),
            }],
        );

        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.request_id(), Some(7));
        match decoded {
            ClientMessage::PushOps {
                document_id, ops, ..
            } => {
                assert_eq!(document_id, doc_id.to_bs58check());
                assert_eq!(ops[0].ciphertext, vec![0, 255, 1, 254]);
            }
            other => panic!("Expected PushOps, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_pull_response_decoding() {
        let msg = ServerMessage::Updates {
            request_id: 3,
            response: PullResponse::UseSnapshot {
                snapshot_version: 12,
            },
        };

        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ServerMessage::Updates { response, .. } => {
                assert_eq!(
                    response,
                    PullResponse::UseSnapshot {
                        snapshot_version: 12
                    }
                );
            }
            _ => panic!("Expected Updates message"),
        }
    }

    #[test]
    fn test_unsolicited_frames_have_no_request_id() {
        let published = ServerMessage::Published {
            document_id: DocumentId::new().to_bs58check(),
            author_id: "peer".to_string(),
            ciphertext: vec![1],
        };
        assert_eq!(published.request_id(), None);

        let error = ServerMessage::Error {
            request_id: Some(4),
            message: "nope".to_string(),
        };
        assert_eq!(error.request_id(), Some(4));
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let err = ServerMessage::decode(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, RemoteError::Protocol(_)));
    }
}
