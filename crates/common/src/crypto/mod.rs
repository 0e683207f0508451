//! Token encryption at rest and key rotation.

pub mod encryption;
pub mod rotation;

pub use encryption::{validate_key, EncryptionKey, TokenCipher, IV_LENGTH, KEY_LENGTH};
pub use rotation::{KeyRotator, RotationReport, ROTATION_BATCH_SIZE};
