//! Data models for the sync engine
//!
//! Defines the records the engine persists and ships around: encrypted
//! deltas ([`Op`]), encrypted checkpoints ([`Snapshot`]), and the opaque
//! [`VersionMarker`] the document hands out.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document_id::DocumentId;

/// Identifier of a single op (client-generated, globally unique)
pub type OpId = String;

/// Identity of a writer, as declared to the relay
pub type AuthorId = String;

/// Local timestamp in milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Opaque, document-owned version token
///
/// The engine only stores, compares and forwards these bytes; it never
/// interprets them.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMarker(#[serde(with = "serde_bytes")] Vec<u8>);

impl VersionMarker {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Marker of a document that has seen nothing yet
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Text form used in sync metadata
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, base64::DecodeError> {
        BASE64.decode(s.trim()).map(Self)
    }
}

impl fmt::Debug for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionMarker({} bytes)", self.0.len())
    }
}

/// One encrypted document delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub id: OpId,
    pub document_id: DocumentId,
    /// Document version after this delta
    pub version_marker: VersionMarker,
    pub ciphertext: Vec<u8>,
    /// Acknowledged by the relay
    pub pushed: bool,
    /// Creation order; replay and compaction pressure follow it
    pub created_at: Timestamp,
}

impl Op {
    /// Create a new unpushed op with a fresh ID
    pub fn new(
        document_id: DocumentId,
        version_marker: VersionMarker,
        ciphertext: Vec<u8>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document_id,
            version_marker,
            ciphertext,
            pushed: false,
            created_at,
        }
    }

    /// Size of the stored payload in bytes
    pub fn size(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn created_at_utc(&self) -> DateTime<Utc> {
        timestamp_to_utc(self.created_at)
    }
}

/// One encrypted full-document checkpoint (at most one per document)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub document_id: DocumentId,
    pub version_marker: VersionMarker,
    pub ciphertext: Vec<u8>,
    pub updated_at: Timestamp,
}

impl Snapshot {
    pub fn updated_at_utc(&self) -> DateTime<Utc> {
        timestamp_to_utc(self.updated_at)
    }
}

/// Compaction pressure accumulated since the last snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpStats {
    pub count: u64,
    pub bytes: u64,
}

/// Monotonic millisecond clock
///
/// Never hands out the same value twice and never goes backwards, even if
/// the wall clock does.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock that will only return values greater than `floor`
    pub fn starting_after(floor: Timestamp) -> Self {
        Self {
            last: AtomicI64::new(floor),
        }
    }

    /// Next timestamp, strictly greater than every previous one
    pub fn next(&self) -> Timestamp {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// Make sure future values are greater than `ts`
    pub fn observe(&self, ts: Timestamp) {
        self.last.fetch_max(ts, Ordering::SeqCst);
    }
}

fn timestamp_to_utc(ts: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
