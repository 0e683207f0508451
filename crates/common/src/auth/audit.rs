// Audit trail for token lifecycle events

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::CommonResult;
use crate::storage::AuditRepository;

/// Types of lifecycle events written to the audit log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AuthorizationStarted,
    AuthorizationCompleted,
    AuthorizationFailed,
    TokenStored,
    TokenRefreshed,
    TokenRefreshFailed,
    TokenRevoked,
    TokensRevokedAll,
    KeyRotated,
}

impl AuditEventType {
    /// Get the event type as a string
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationStarted => "authorization_started",
            Self::AuthorizationCompleted => "authorization_completed",
            Self::AuthorizationFailed => "authorization_failed",
            Self::TokenStored => "token_stored",
            Self::TokenRefreshed => "token_refreshed",
            Self::TokenRefreshFailed => "token_refresh_failed",
            Self::TokenRevoked => "token_revoked",
            Self::TokensRevokedAll => "tokens_revoked_all",
            Self::KeyRotated => "key_rotated",
        }
    }

    /// Parse the string form produced by [`AuditEventType::as_str`]
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::AuthorizationStarted,
            Self::AuthorizationCompleted,
            Self::AuthorizationFailed,
            Self::TokenStored,
            Self::TokenRefreshed,
            Self::TokenRefreshFailed,
            Self::TokenRevoked,
            Self::TokensRevokedAll,
            Self::KeyRotated,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == raw)
    }
}

/// One append-only audit record
///
/// `principal_id` is `None` for events that span every principal
/// (bulk revocation, key rotation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub principal_id: Option<String>,
    pub event_type: AuditEventType,
    pub provider: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event stamped with a fresh v7 id and the current time
    #[must_use]
    pub fn new(
        principal_id: Option<&str>,
        event_type: AuditEventType,
        provider: &str,
        metadata: Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            principal_id: principal_id.map(str::to_owned),
            event_type,
            provider: provider.to_string(),
            metadata,
            timestamp: Utc::now(),
        }
    }
}

/// Best-effort writer in front of an [`AuditRepository`]
///
/// Sink failures are logged and swallowed so that auditing never blocks a
/// token operation.
#[derive(Clone)]
pub struct AuditTrail {
    repository: Arc<dyn AuditRepository>,
    provider: String,
}

impl AuditTrail {
    /// Create a trail that stamps every event with `provider`
    pub fn new(repository: Arc<dyn AuditRepository>, provider: impl Into<String>) -> Self {
        Self { repository, provider: provider.into() }
    }

    /// Append an event, logging instead of failing when the sink errors
    pub async fn record(
        &self,
        principal_id: Option<&str>,
        event_type: AuditEventType,
        metadata: Value,
    ) {
        let event = AuditEvent::new(principal_id, event_type, &self.provider, metadata);
        if let Err(e) = self.repository.append(event).await {
            warn!(
                event_type = event_type.as_str(),
                principal_id = principal_id.unwrap_or("-"),
                error = %e,
                "Failed to write audit event"
            );
        }
    }

    /// Recent events for one principal, newest first
    ///
    /// # Errors
    /// Propagates the repository error; unlike `record`, reads are not
    /// best-effort.
    pub async fn history(&self, principal_id: &str, limit: usize) -> CommonResult<Vec<AuditEvent>> {
        self.repository.list_for_principal(principal_id, limit).await
    }

    /// Delete events older than `cutoff`
    ///
    /// # Errors
    /// Propagates the repository error.
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> CommonResult<usize> {
        self.repository.delete_older_than(cutoff).await
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").field("provider", &self.provider).finish_non_exhaustive()
    }
}
