//! AES-256-GCM encryption of token material at rest.
//!
//! - [`EncryptionKey`]: validated 32-byte key, zeroized on drop
//! - [`TokenCipher`]: encrypt/decrypt to a self-contained text blob
//!
//! ## Blob format
//!
//! `base64(iv || ciphertext || tag)` with a fresh random 96-bit IV per call.
//! Decryption fails closed: a wrong key, a flipped bit, truncation or bad
//! base64 all produce `DecryptionError`, never partial plaintext.
//!
//! ```rust
//! use tokenward_common::crypto::{EncryptionKey, TokenCipher};
//!
//! let cipher = TokenCipher::new(&EncryptionKey::generate());
//! let blob = cipher.encrypt(b"refresh-token")?;
//! assert_eq!(cipher.decrypt(&blob)?, b"refresh-token");
//! # Ok::<(), tokenward_common::auth::AuthError>(())
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::auth::error::{AuthError, AuthResult};

/// Required key length in bytes
pub const KEY_LENGTH: usize = 32;
/// IV length in bytes (96-bit GCM nonce)
pub const IV_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// Check that raw key material is usable for AES-256
///
/// # Errors
/// Returns `Configuration` when the key is not exactly 32 bytes.
pub fn validate_key(key: &[u8]) -> AuthResult<()> {
    if key.len() == KEY_LENGTH {
        Ok(())
    } else {
        Err(AuthError::configuration(format!(
            "encryption key must be exactly {KEY_LENGTH} bytes, got {}",
            key.len()
        )))
    }
}

/// 32-byte AES-256 key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LENGTH]);

impl EncryptionKey {
    /// Build from raw bytes
    ///
    /// # Errors
    /// Returns `Configuration` when `bytes` is not 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> AuthResult<Self> {
        validate_key(bytes)?;
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Build from a standard base64 string (the configuration format)
    ///
    /// # Errors
    /// Returns `Configuration` on invalid base64 or wrong decoded length.
    pub fn from_base64(encoded: &str) -> AuthResult<Self> {
        let mut decoded = BASE64
            .decode(encoded.trim())
            .map_err(|e| AuthError::configuration(format!("encryption key is not base64: {e}")))?;
        let key = Self::from_bytes(&decoded);
        decoded.zeroize();
        key
    }

    /// Generate a random key from the OS CSPRNG
    ///
    /// For provisioning and tests only. Services never generate a key on
    /// their own when one is missing.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Encode the key as standard base64
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Short, non-reversible identifier for logs
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey").field("fingerprint", &self.fingerprint()).finish()
    }
}

/// AES-256-GCM cipher for token blobs
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("key", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl TokenCipher {
    /// Create a cipher bound to `key`
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self { cipher, fingerprint: key.fingerprint() }
    }

    /// Fingerprint of the bound key
    #[must_use]
    pub fn key_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypt bytes into a base64 blob
    ///
    /// # Errors
    /// Returns `DecryptionError` if the AEAD layer rejects the input, which
    /// only happens for plaintexts beyond the GCM length limit.
    pub fn encrypt(&self, plaintext: &[u8]) -> AuthResult<String> {
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| AuthError::decryption(format!("encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(IV_LENGTH + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`TokenCipher::encrypt`]
    ///
    /// # Errors
    /// Returns `DecryptionError` on bad base64, truncation, wrong key or any
    /// tag mismatch.
    pub fn decrypt(&self, blob: &str) -> AuthResult<Vec<u8>> {
        let raw = BASE64
            .decode(blob)
            .map_err(|e| AuthError::decryption(format!("blob is not base64: {e}")))?;

        if raw.len() < IV_LENGTH + TAG_LENGTH {
            return Err(AuthError::decryption("blob is truncated"));
        }

        let (iv, ciphertext) = raw.split_at(IV_LENGTH);
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| AuthError::decryption("authentication tag mismatch"))
    }

    /// Decrypt with `self` and re-encrypt with `target`
    ///
    /// # Errors
    /// Propagates the decryption failure of the source blob.
    pub fn reencrypt(&self, blob: &str, target: &TokenCipher) -> AuthResult<String> {
        let mut plaintext = self.decrypt(blob)?;
        let result = target.encrypt(&plaintext);
        plaintext.zeroize();
        result
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for crypto::encryption.
    use super::*;
    use crate::auth::AuthErrorKind;

    /// Validates `EncryptionKey::from_bytes` behavior for the invalid key size
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures 16 and 33 byte keys are rejected as configuration errors.
    #[test]
    fn test_rejects_invalid_key_size() {
        for len in [0, 16, 31, 33] {
            let err = EncryptionKey::from_bytes(&vec![0u8; len]).unwrap_err();
            assert_eq!(err.kind(), AuthErrorKind::Configuration);
        }
        assert!(EncryptionKey::from_bytes(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_base64_key_round_trip() {
        let key = EncryptionKey::generate();
        let restored = EncryptionKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.fingerprint(), restored.fingerprint());
        assert!(EncryptionKey::from_base64("not base64!").is_err());
        assert!(EncryptionKey::from_base64(&BASE64.encode([1u8; 16])).is_err());
    }

    /// Validates `TokenCipher::encrypt` behavior for the fresh IV scenario.
    ///
    /// Assertions:
    /// - Confirms two encryptions of the same plaintext differ.
    /// - Confirms both decrypt to the original.
    #[test]
    fn test_encrypt_uses_fresh_iv() {
        let cipher = TokenCipher::new(&EncryptionKey::generate());
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();

        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), b"same");
        assert_eq!(cipher.decrypt(&b).unwrap(), b"same");
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let cipher = TokenCipher::new(&EncryptionKey::generate());
        let other = TokenCipher::new(&EncryptionKey::generate());
        let blob = cipher.encrypt(b"secret").unwrap();

        let err = other.decrypt(&blob).unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::DecryptionError);
    }

    /// Validates `TokenCipher::decrypt` behavior for the tampered blob
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures flipping any single byte yields `DecryptionError`.
    /// - Ensures truncated and non-base64 input are rejected.
    #[test]
    fn test_tampered_blob_fails_closed() {
        let cipher = TokenCipher::new(&EncryptionKey::generate());
        let blob = cipher.encrypt(b"refresh-token-value").unwrap();
        let raw = BASE64.decode(&blob).unwrap();

        for idx in 0..raw.len() {
            let mut flipped = raw.clone();
            flipped[idx] ^= 0x01;
            let err = cipher.decrypt(&BASE64.encode(&flipped)).unwrap_err();
            assert_eq!(err.kind(), AuthErrorKind::DecryptionError, "byte {idx}");
        }

        assert!(cipher.decrypt(&BASE64.encode(&raw[..IV_LENGTH + 4])).is_err());
        assert!(cipher.decrypt("%%%").is_err());
    }

    #[test]
    fn test_reencrypt_moves_blob_to_new_key() {
        let old = TokenCipher::new(&EncryptionKey::generate());
        let new = TokenCipher::new(&EncryptionKey::generate());
        let blob = old.encrypt(b"payload").unwrap();

        let moved = old.reencrypt(&blob, &new).unwrap();
        assert_eq!(new.decrypt(&moved).unwrap(), b"payload");
        assert!(old.decrypt(&moved).is_err());
        assert_ne!(old.key_fingerprint(), new.key_fingerprint());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = EncryptionKey::generate();
        let rendered = format!("{:?}", TokenCipher::new(&key));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains(&key.to_base64()));
    }
}
