//! PKCE (Proof Key for Code Exchange) implementation for OAuth 2.0
//!
//! Implements RFC 7636 with the `S256` method only. Also generates the CSRF
//! `state` value bound to each authorization round trip.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::error::{AuthError, AuthResult};

/// Minimum verifier length allowed by RFC 7636
pub const MIN_VERIFIER_LENGTH: usize = 43;
/// Maximum verifier length allowed by RFC 7636
pub const MAX_VERIFIER_LENGTH: usize = 128;
/// The only challenge method this crate emits
pub const CHALLENGE_METHOD: &str = "S256";

const VERIFIER_ENTROPY_BYTES: usize = 32;
const STATE_ENTROPY_BYTES: usize = 16;

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a cryptographically secure code verifier
///
/// 32 random bytes from the OS CSPRNG, base64url without padding (43 chars).
#[must_use]
pub fn generate_code_verifier() -> String {
    random_urlsafe(VERIFIER_ENTROPY_BYTES)
}

/// Generate a random state token for CSRF protection
///
/// 16 random bytes, base64url without padding (22 chars).
#[must_use]
pub fn generate_state() -> String {
    random_urlsafe(STATE_ENTROPY_BYTES)
}

/// Check verifier length and alphabet (`[A-Za-z0-9-._~]`)
#[must_use]
pub fn validate_verifier_format(verifier: &str) -> bool {
    (MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&verifier.len())
        && verifier.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// Derive the S256 code challenge: BASE64URL(SHA256(ASCII(verifier)))
///
/// # Errors
/// Returns `InvalidRequest` if the verifier length is outside 43..=128.
pub fn derive_code_challenge(verifier: &str) -> AuthResult<String> {
    let len = verifier.len();
    if !(MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&len) {
        return Err(AuthError::invalid_request(format!(
            "code verifier must be {MIN_VERIFIER_LENGTH}-{MAX_VERIFIER_LENGTH} characters, got {len}"
        )));
    }

    let hash = Sha256::digest(verifier.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(hash))
}

/// Recompute the challenge for `verifier` and compare in constant time
#[must_use]
pub fn verify_challenge(verifier: &str, challenge: &str) -> bool {
    derive_code_challenge(verifier)
        .map(|expected| constant_time_eq(expected.as_bytes(), challenge.as_bytes()))
        .unwrap_or(false)
}

/// Byte comparison whose running time does not depend on where inputs differ
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// PKCE verifier/challenge pair
#[derive(Clone)]
pub struct PkceChallenge {
    /// Random secret, kept server side until token exchange
    pub code_verifier: String,
    /// SHA256 of the verifier, sent in the authorization request
    pub code_challenge: String,
}

impl PkceChallenge {
    /// Generate a fresh verifier and its S256 challenge
    ///
    /// # Examples
    /// ```
    /// use tokenward_common::auth::pkce::{verify_challenge, PkceChallenge};
    ///
    /// let pkce = PkceChallenge::generate();
    /// assert_eq!(pkce.code_verifier.len(), 43);
    /// assert!(verify_challenge(&pkce.code_verifier, &pkce.code_challenge));
    /// ```
    #[must_use]
    pub fn generate() -> Self {
        let code_verifier = generate_code_verifier();
        let hash = Sha256::digest(code_verifier.as_bytes());
        Self { code_verifier, code_challenge: URL_SAFE_NO_PAD.encode(hash) }
    }

    /// Challenge method (always "S256")
    #[must_use]
    pub const fn method(&self) -> &'static str {
        CHALLENGE_METHOD
    }
}

impl std::fmt::Debug for PkceChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceChallenge")
            .field("code_verifier", &"[REDACTED]")
            .field("code_challenge", &self.code_challenge)
            .finish()
    }
}
