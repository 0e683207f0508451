//! CSRF state store for the authorization redirect round trip
//!
//! Each authorization attempt gets one [`AuthState`] row holding the state
//! value, the PKCE verifier and the redirect URI it was issued for. The row
//! is removed by the same atomic `take` that reads it, so a state value can
//! be used at most once whether validation succeeds or fails.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use super::error::{AuthError, AuthResult};
use super::pkce::{constant_time_eq, generate_state, PkceChallenge};
use super::types::{AuthState, PendingAuthorization, AUTH_STATE_TTL_SECS};
use crate::storage::StateRepository;

/// Issues and consumes single-use authorization states
#[derive(Clone)]
pub struct CsrfStateStore {
    repository: Arc<dyn StateRepository>,
    ttl: Duration,
}

impl CsrfStateStore {
    /// Store with the default 10 minute lifetime
    pub fn new(repository: Arc<dyn StateRepository>) -> Self {
        Self::with_ttl(repository, Duration::seconds(AUTH_STATE_TTL_SECS))
    }

    /// Store with a custom lifetime
    pub fn with_ttl(repository: Arc<dyn StateRepository>, ttl: Duration) -> Self {
        Self { repository, ttl }
    }

    /// Configured state lifetime
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create and persist a new pending authorization bound to `redirect_uri`
    ///
    /// # Errors
    /// Returns `Storage` if the row cannot be written.
    pub async fn create_state(&self, redirect_uri: &str) -> AuthResult<PendingAuthorization> {
        let pkce = PkceChallenge::generate();
        let now = Utc::now();
        let row = AuthState {
            state: generate_state(),
            code_verifier: pkce.code_verifier.clone(),
            redirect_uri: redirect_uri.to_string(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        let pending = PendingAuthorization {
            state: row.state.clone(),
            code_challenge: pkce.code_challenge,
            redirect_uri: row.redirect_uri.clone(),
            expires_at: row.expires_at,
        };

        self.repository.insert(row).await?;
        debug!(expires_at = %pending.expires_at, "Created authorization state");
        Ok(pending)
    }

    /// Validate a state together with the verifier the caller presents
    ///
    /// The row is consumed whatever the outcome.
    ///
    /// # Errors
    /// Returns `InvalidState` if the state is unknown, already used, expired,
    /// or bound to a different verifier.
    pub async fn validate_state(
        &self,
        state: &str,
        presented_verifier: &str,
    ) -> AuthResult<AuthState> {
        let row = self.take_live(state).await?;
        if !constant_time_eq(row.code_verifier.as_bytes(), presented_verifier.as_bytes()) {
            warn!("Authorization state presented with a mismatched verifier");
            return Err(AuthError::invalid_state("code verifier does not match state"));
        }
        Ok(row)
    }

    /// Consume a state at callback time, checking the redirect URI binding
    ///
    /// The row is consumed whatever the outcome.
    ///
    /// # Errors
    /// Returns `InvalidState` if the state is unknown, already used, expired,
    /// or was issued for a different redirect URI.
    pub async fn consume(&self, state: &str, redirect_uri: &str) -> AuthResult<AuthState> {
        let row = self.take_live(state).await?;
        if row.redirect_uri != redirect_uri {
            warn!("Authorization state presented with a different redirect_uri");
            return Err(AuthError::invalid_state("redirect_uri does not match state"));
        }
        Ok(row)
    }

    /// Delete every expired state row
    ///
    /// # Errors
    /// Returns `Storage` on repository failure.
    pub async fn sweep_expired(&self) -> AuthResult<usize> {
        Ok(self.repository.delete_expired(Utc::now()).await?)
    }

    async fn take_live(&self, state: &str) -> AuthResult<AuthState> {
        if state.is_empty() {
            return Err(AuthError::invalid_state("state parameter is missing"));
        }

        let row = self
            .repository
            .take(state)
            .await?
            .ok_or_else(|| AuthError::invalid_state("unknown or already used state"))?;

        if row.is_expired_at(Utc::now()) {
            warn!(expired_at = %row.expires_at, "Authorization state expired");
            return Err(AuthError::invalid_state("state expired"));
        }

        Ok(row)
    }
}

impl std::fmt::Debug for CsrfStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfStateStore").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}
