//! Authenticated encryption for telemetry payloads.
//!
//! Batches are serialised to JSON and sealed with AES-256-GCM under a key
//! derived from the project credentials. The wire form is URL-safe base64
//! of `nonce (12 B) ‖ ciphertext ‖ tag (16 B)`; the backend holding the same
//! credentials derives the same key and opens the payload.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// 96-bit nonce, the GCM-recommended size.
const NONCE_SIZE: usize = 12;

/// Errors produced while sealing or opening payloads.
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to encrypt payload")]
    Encrypt,

    #[error("invalid or tampered payload")]
    Decrypt,

    #[error("encryption key failed round-trip verification")]
    KeyVerification,
}

/// Derives the 256-bit project key: `SHA-256(api_key ":" project_id)`.
pub fn derive_project_key(api_key: &str, project_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(b":");
    hasher.update(project_id.as_bytes());
    hasher.finalize().into()
}

/// Seals and opens telemetry payloads under a project-derived key.
#[derive(Clone)]
pub struct PayloadEncryptor {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for PayloadEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadEncryptor").finish_non_exhaustive()
    }
}

impl PayloadEncryptor {
    /// Creates an encryptor for the given project credentials.
    pub fn new(api_key: &str, project_id: &str) -> Self {
        let key = derive_project_key(api_key, project_id);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        PayloadEncryptor { cipher }
    }

    /// Serialises `payload` to JSON and seals it.
    ///
    /// A fresh CSPRNG nonce is drawn per message; reuse would break GCM.
    pub fn encrypt<T: Serialize>(&self, payload: &T) -> Result<String, EncryptionError> {
        let plaintext = serde_json::to_vec(payload)?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| EncryptionError::Encrypt)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(URL_SAFE.encode(combined))
    }

    /// Opens a sealed payload. Any tampering with nonce, ciphertext or tag
    /// fails authentication.
    pub fn decrypt<T: DeserializeOwned>(&self, encrypted: &str) -> Result<T, EncryptionError> {
        let combined = URL_SAFE
            .decode(encrypted)
            .map_err(|_| EncryptionError::Decrypt)?;
        if combined.len() < NONCE_SIZE {
            return Err(EncryptionError::Decrypt);
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::Decrypt)?;

        serde_json::from_slice(&plaintext).map_err(EncryptionError::Serialization)
    }

    /// Verifies the key with an encrypt→decrypt round-trip of a probe value.
    pub fn verify(&self) -> Result<(), EncryptionError> {
        let probe = serde_json::json!({ "probe": 1 });
        let sealed = self.encrypt(&probe).map_err(|_| EncryptionError::KeyVerification)?;
        let opened: serde_json::Value = self
            .decrypt(&sealed)
            .map_err(|_| EncryptionError::KeyVerification)?;
        if opened == probe {
            Ok(())
        } else {
            Err(EncryptionError::KeyVerification)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_key_matches_sha256_of_joined_credentials() {
        let key = derive_project_key("k", "p");
        let expected: [u8; 32] = Sha256::digest(b"k:p").into();
        assert_eq!(key, expected);
    }

    #[test]
    fn test_round_trip() {
        let encryptor = PayloadEncryptor::new("test-api-key", "proj-1");
        let payload = serde_json::json!({ "a": 1 });

        let sealed = encryptor.encrypt(&payload).unwrap();
        let opened: serde_json::Value = encryptor.decrypt(&sealed).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_nonce_uniqueness_yields_distinct_ciphertexts() {
        let encryptor = PayloadEncryptor::new("test-api-key", "proj-1");
        let payload = serde_json::json!({ "a": 1 });
        let first = encryptor.encrypt(&payload).unwrap();
        let second = encryptor.encrypt(&payload).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let encryptor = PayloadEncryptor::new("test-api-key", "proj-1");
        let sealed = encryptor.encrypt(&serde_json::json!({ "a": 1 })).unwrap();

        let mut raw = URL_SAFE.decode(&sealed).unwrap();
        // Flip one bit anywhere in nonce, ciphertext or tag.
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE.encode(raw);

        let result: Result<serde_json::Value, _> = encryptor.decrypt(&tampered);
        assert!(matches!(result, Err(EncryptionError::Decrypt)));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let encryptor = PayloadEncryptor::new("test-api-key", "proj-1");
        let other = PayloadEncryptor::new("test-api-key", "proj-2");

        let sealed = encryptor.encrypt(&serde_json::json!({ "a": 1 })).unwrap();
        let result: Result<serde_json::Value, _> = other.decrypt(&sealed);
        assert!(matches!(result, Err(EncryptionError::Decrypt)));
    }

    #[test]
    fn test_garbage_input_is_rejected() {
        let encryptor = PayloadEncryptor::new("test-api-key", "proj-1");
        let result: Result<serde_json::Value, _> = encryptor.decrypt("@@not-base64@@");
        assert!(matches!(result, Err(EncryptionError::Decrypt)));

        let short = URL_SAFE.encode([0u8; 4]);
        let result: Result<serde_json::Value, _> = encryptor.decrypt(&short);
        assert!(matches!(result, Err(EncryptionError::Decrypt)));
    }

    #[test]
    fn test_verify_round_trip() {
        let encryptor = PayloadEncryptor::new("test-api-key", "proj-1");
        assert!(encryptor.verify().is_ok());
    }
}
