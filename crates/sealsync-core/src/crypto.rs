//! Payload encryption
//!
//! Every delta and snapshot leaves the document encrypted, both on disk and
//! on the wire. The engine only needs [`PayloadCipher`]; [`AesGcmCipher`] is
//! the AES-256-GCM implementation used by default.
//!
//! Ciphertext layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Errors from the encryption layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("Encryption failed")]
    Encryption,

    /// Tampered payload or wrong key
    #[error("Decryption failed: {0}")]
    Decryption(&'static str),
}

/// Symmetric authenticated encryption of sync payloads
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Fails with [`CryptoError::Decryption`] on tamper or key mismatch
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// AES-256 key, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeySize {
                    expected: KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self { bytes })
    }

    /// Parse the base64 form stored in key files
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let mut raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        let key = Self::from_bytes(&raw);
        raw.zeroize();
        key
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }

    /// Raw key bytes. Do not log these.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// AES-256-GCM payload cipher with random per-message nonces
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { cipher }
    }
}

impl PayloadCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend(ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption("ciphertext too short"));
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decryption("authentication failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = AesGcmCipher::new(&EncryptionKey::generate());
        let sealed = cipher.encrypt(b"hello delta").unwrap();

        assert_eq!(sealed.len(), NONCE_SIZE + b"hello delta".len() + TAG_SIZE);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"hello delta");
    }

    #[test]
    fn test_nonces_differ_per_message() {
        let cipher = AesGcmCipher::new(&EncryptionKey::generate());
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let cipher = AesGcmCipher::new(&EncryptionKey::generate());
        let mut sealed = cipher.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            cipher.decrypt(&sealed),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let sealed = AesGcmCipher::new(&EncryptionKey::generate())
            .encrypt(b"payload")
            .unwrap();
        let other = AesGcmCipher::new(&EncryptionKey::generate());

        assert!(matches!(other.decrypt(&sealed), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_short_ciphertext_is_rejected() {
        let cipher = AesGcmCipher::new(&EncryptionKey::generate());
        assert!(matches!(
            cipher.decrypt(&[0u8; 8]),
            Err(CryptoError::Decryption("ciphertext too short"))
        ));
    }

    #[test]
    fn test_key_base64_round_trip() {
        let key = EncryptionKey::generate();
        let parsed = EncryptionKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());

        assert!(matches!(
            EncryptionKey::from_base64(&BASE64.encode([0u8; 5])),
            Err(CryptoError::InvalidKeySize { actual: 5, .. })
        ));
        assert!(format!("{:?}", key).contains("REDACTED"));
    }
}
