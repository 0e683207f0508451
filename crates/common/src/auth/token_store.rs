//! Encrypted token persistence
//!
//! [`TokenStore`] owns the mapping between decrypted [`TokenRecord`]s and
//! the encrypted rows held by a [`TokenRepository`]. It also performs the
//! provider-facing halves of refresh and revocation, and writes the matching
//! audit events.
//!
//! Concurrency is not handled here: two concurrent `refresh` calls for the
//! same principal hit the provider twice. Callers that need de-duplication
//! go through [`super::lifecycle::TokenLifecycleManager`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use super::audit::{AuditEventType, AuditTrail};
use super::error::{AuthError, AuthResult};
use super::traits::IdentityProvider;
use super::types::{EncryptedTokenRow, ProviderTokens, ScopeSet, TokenRecord, TokenSecrets};
use crate::crypto::TokenCipher;
use crate::error::ErrorClassification;
use crate::storage::{TokenFilter, TokenRepository};

/// Encrypted token persistence for one identity provider
pub struct TokenStore {
    repository: Arc<dyn TokenRepository>,
    cipher: RwLock<Arc<TokenCipher>>,
    provider: Arc<dyn IdentityProvider>,
    audit: AuditTrail,
}

impl TokenStore {
    /// Create a store
    pub fn new(
        repository: Arc<dyn TokenRepository>,
        cipher: TokenCipher,
        provider: Arc<dyn IdentityProvider>,
        audit: AuditTrail,
    ) -> Self {
        Self { repository, cipher: RwLock::new(Arc::new(cipher)), provider, audit }
    }

    /// Provider label written to every row
    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    /// Backing repository (used by key rotation)
    #[must_use]
    pub fn repository(&self) -> Arc<dyn TokenRepository> {
        Arc::clone(&self.repository)
    }

    /// Cipher currently used for reads and writes
    #[must_use]
    pub fn cipher(&self) -> Arc<TokenCipher> {
        self.cipher.read().clone()
    }

    /// Swap the cipher after a key rotation
    pub fn replace_cipher(&self, cipher: TokenCipher) {
        info!(fingerprint = cipher.key_fingerprint(), "Token cipher replaced");
        *self.cipher.write() = Arc::new(cipher);
    }

    /// Audit trail shared with the rest of the stack
    #[must_use]
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Encrypt and upsert tokens for `principal_id`
    ///
    /// # Errors
    /// Returns `Storage` if serialization or the upsert fails.
    pub async fn store(
        &self,
        principal_id: &str,
        tokens: &ProviderTokens,
    ) -> AuthResult<TokenRecord> {
        let record = self.persist(principal_id, tokens).await?;
        self.audit
            .record(
                Some(principal_id),
                AuditEventType::TokenStored,
                json!({
                    "expires_at": record.expires_at.to_rfc3339(),
                    "scope": record.scope.to_string(),
                    "has_refresh_token": record.refresh_token.is_some(),
                }),
            )
            .await;
        Ok(record)
    }

    /// Return the stored record, refreshing it first when already expired
    ///
    /// # Errors
    /// Returns the refresh failure when the record is expired and cannot be
    /// refreshed (including `InvalidGrant` when no refresh token is stored).
    pub async fn get(&self, principal_id: &str) -> AuthResult<Option<TokenRecord>> {
        match self.load(principal_id).await? {
            Some(record) if record.is_expired_at(Utc::now()) => {
                debug!(principal_id, "Stored access token expired, refreshing");
                self.refresh(principal_id).await.map(Some)
            }
            other => Ok(other),
        }
    }

    /// Decrypt the stored record without any refresh side effect
    ///
    /// # Errors
    /// `DecryptionError` when the row cannot be authenticated, `Storage` on
    /// repository failure.
    pub async fn load(&self, principal_id: &str) -> AuthResult<Option<TokenRecord>> {
        let Some(row) = self.repository.get(principal_id, self.provider_name()).await? else {
            return Ok(None);
        };
        self.decrypt_row(&row).map(Some)
    }

    /// Redeem the stored refresh token and persist the new tokens
    ///
    /// When the provider does not return a new refresh token the previous one
    /// is kept.
    ///
    /// # Errors
    /// `InvalidGrant` when nothing is stored or no refresh token is present;
    /// otherwise the provider failure.
    pub async fn refresh(&self, principal_id: &str) -> AuthResult<TokenRecord> {
        let current = self
            .load(principal_id)
            .await?
            .ok_or_else(|| AuthError::invalid_grant("no tokens stored for principal"))?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::invalid_grant("no refresh token available"))?;

        match self.provider.refresh_tokens(&refresh_token).await {
            Ok(mut tokens) => {
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token);
                }
                let record = self.persist(principal_id, &tokens).await?;
                info!(principal_id, expires_at = %record.expires_at, "Access token refreshed");
                self.audit
                    .record(
                        Some(principal_id),
                        AuditEventType::TokenRefreshed,
                        json!({ "expires_at": record.expires_at.to_rfc3339() }),
                    )
                    .await;
                Ok(record)
            }
            Err(e) => {
                warn!(principal_id, error = %e, retryable = e.is_retryable(), "Token refresh failed");
                self.audit
                    .record(
                        Some(principal_id),
                        AuditEventType::TokenRefreshFailed,
                        json!({ "error": e.kind().as_str() }),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Revoke at the provider (best effort) and delete the local row
    ///
    /// Provider failures, and stored rows that can no longer be decrypted, are
    /// logged and never prevent the local delete.
    ///
    /// # Errors
    /// Only the local delete can fail the call.
    pub async fn revoke(&self, principal_id: &str) -> AuthResult<bool> {
        match self.load(principal_id).await {
            Ok(Some(record)) => {
                let token = record.refresh_token.as_deref().unwrap_or(&record.access_token);
                if let Err(e) = self.provider.revoke(token).await {
                    warn!(principal_id, error = %e, "Provider revocation failed, deleting locally");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(principal_id, error = %e, "Could not read tokens for provider revocation");
            }
        }

        self.delete_local(principal_id, "revoked").await
    }

    /// Delete the local row without contacting the provider
    ///
    /// # Errors
    /// Returns `Storage` on repository failure.
    pub async fn delete_local(&self, principal_id: &str, reason: &str) -> AuthResult<bool> {
        let existed = self.repository.delete(principal_id, self.provider_name()).await?;
        if existed {
            info!(principal_id, reason, "Tokens removed");
            self.audit
                .record(Some(principal_id), AuditEventType::TokenRevoked, json!({ "reason": reason }))
                .await;
        }
        Ok(existed)
    }

    /// Delete rows whose expiry is older than `grace`
    ///
    /// # Errors
    /// Returns `Storage` on repository failure.
    pub async fn sweep_expired(&self, grace: Duration) -> AuthResult<usize> {
        let cutoff = Utc::now() - grace;
        Ok(self.repository.delete_where(&TokenFilter::ExpiresBefore(cutoff)).await?)
    }

    /// Principals whose access token expires within `window`
    ///
    /// # Errors
    /// Returns `Storage` on repository failure.
    pub async fn principals_expiring_within(&self, window: Duration) -> AuthResult<Vec<String>> {
        let cutoff = Utc::now() + window;
        self.principals_matching(&TokenFilter::ExpiresBefore(cutoff)).await
    }

    /// Every principal with a stored row
    ///
    /// # Errors
    /// Returns `Storage` on repository failure.
    pub async fn principals(&self) -> AuthResult<Vec<String>> {
        self.principals_matching(&TokenFilter::All).await
    }

    async fn principals_matching(&self, filter: &TokenFilter) -> AuthResult<Vec<String>> {
        let rows = self.repository.list(filter).await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.provider == self.provider_name())
            .map(|row| row.principal_id)
            .collect())
    }

    async fn persist(
        &self,
        principal_id: &str,
        tokens: &ProviderTokens,
    ) -> AuthResult<TokenRecord> {
        let now = Utc::now();
        let secrets = TokenSecrets {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            token_type: tokens.token_type.clone(),
            scope: tokens.scope.to_string(),
        };
        let payload = serde_json::to_vec(&secrets)?;
        let ciphertext = self.cipher().encrypt(&payload)?;

        self.repository
            .upsert(EncryptedTokenRow {
                principal_id: principal_id.to_string(),
                provider: self.provider_name().to_string(),
                ciphertext,
                expires_at: tokens.expires_at,
                updated_at: now,
            })
            .await?;

        Ok(TokenRecord {
            principal_id: principal_id.to_string(),
            provider: self.provider_name().to_string(),
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            token_type: tokens.token_type.clone(),
            scope: tokens.scope.clone(),
            expires_at: tokens.expires_at,
            updated_at: now,
        })
    }

    fn decrypt_row(&self, row: &EncryptedTokenRow) -> AuthResult<TokenRecord> {
        let plaintext = self.cipher().decrypt(&row.ciphertext)?;
        let secrets: TokenSecrets = serde_json::from_slice(&plaintext)
            .map_err(|e| AuthError::decryption(format!("token payload is corrupt: {e}")))?;

        Ok(TokenRecord {
            principal_id: row.principal_id.clone(),
            provider: row.provider.clone(),
            access_token: secrets.access_token.clone(),
            refresh_token: secrets.refresh_token.clone(),
            token_type: secrets.token_type.clone(),
            scope: ScopeSet::parse(&secrets.scope),
            expires_at: row.expires_at,
            updated_at: row.updated_at,
        })
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("provider", &self.provider_name())
            .field("cipher", &self.cipher())
            .finish_non_exhaustive()
    }
}
