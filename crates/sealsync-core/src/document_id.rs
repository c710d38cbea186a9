//! Document identifiers
//!
//! A document ID is a random UUID. Its canonical text form is the bs58check
//! encoding of the 16 UUID bytes, which is what gets written to the local
//! store and sent to the relay.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Errors produced when parsing a document ID
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentIdError {
    #[error("Invalid bs58check encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid document ID length: expected 16 bytes, got {0}")]
    InvalidLength(usize),
}

/// Identifier of a synchronized document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Uuid);

impl DocumentId {
    /// Create a new random document ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Encode as bs58check text
    pub fn to_bs58check(&self) -> String {
        bs58::encode(self.0.as_bytes()).with_check().into_string()
    }

    /// Parse from bs58check text
    pub fn from_bs58check(s: &str) -> Result<Self, DocumentIdError> {
        let bytes = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| DocumentIdError::InvalidEncoding(e.to_string()))?;

        let bytes: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DocumentIdError::InvalidLength(bytes.len()))?;

        Ok(Self(Uuid::from_bytes(bytes)))
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_bs58check())
    }
}

impl FromStr for DocumentId {
    type Err = DocumentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bs58check(s.trim())
    }
}

impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_bs58check())
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_bs58check(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bs58check_round_trip() {
        let id = DocumentId::new();
        let text = id.to_bs58check();
        assert_eq!(DocumentId::from_bs58check(&text).unwrap(), id);
        assert_eq!(text.parse::<DocumentId>().unwrap(), id);
    }

    #[test]
    fn test_rejects_corrupted_checksum() {
        let mut text = DocumentId::new().to_bs58check();
        let last = text.pop().unwrap();
        text.push(if last == '1' { '2' } else { '1' });

        assert!(matches!(
            DocumentId::from_bs58check(&text),
            Err(DocumentIdError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_length() {
        let text = bs58::encode([1u8, 2, 3]).with_check().into_string();
        assert_eq!(
            DocumentId::from_bs58check(&text),
            Err(DocumentIdError::InvalidLength(3))
        );
    }

    #[test]
    fn test_serde_uses_text_form() {
        let id = DocumentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let parsed: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
