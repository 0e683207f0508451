//! In-process implementation of the persistence ports

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::{AuditRepository, StateRepository, TokenFilter, TokenRepository};
use crate::auth::audit::AuditEvent;
use crate::auth::types::{AuthState, EncryptedTokenRow};
use crate::error::CommonResult;

type TokenKey = (String, String);

/// Token rows, pending states and audit events held in memory
///
/// Each map sits behind its own lock; `take` holds the state lock across the
/// read and the delete.
#[derive(Debug, Default)]
pub struct MemoryAuthStore {
    tokens: RwLock<HashMap<TokenKey, EncryptedTokenRow>>,
    states: Mutex<HashMap<String, AuthState>>,
    audit: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuthStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored token rows
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.tokens.read().len()
    }

    /// Number of pending states
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.lock().len()
    }

    /// Number of audit events
    #[must_use]
    pub fn audit_count(&self) -> usize {
        self.audit.read().len()
    }

    /// Snapshot of every audit event, oldest first
    #[must_use]
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.read().clone()
    }
}

#[async_trait]
impl TokenRepository for MemoryAuthStore {
    async fn upsert(&self, row: EncryptedTokenRow) -> CommonResult<()> {
        let key = (row.principal_id.clone(), row.provider.clone());
        self.tokens.write().insert(key, row);
        Ok(())
    }

    async fn get(
        &self,
        principal_id: &str,
        provider: &str,
    ) -> CommonResult<Option<EncryptedTokenRow>> {
        let key = (principal_id.to_string(), provider.to_string());
        Ok(self.tokens.read().get(&key).cloned())
    }

    async fn replace_if_unchanged(
        &self,
        row: EncryptedTokenRow,
        expected_ciphertext: &str,
    ) -> CommonResult<bool> {
        let key = (row.principal_id.clone(), row.provider.clone());
        let mut tokens = self.tokens.write();
        match tokens.get_mut(&key) {
            Some(current) if current.ciphertext == expected_ciphertext => {
                *current = row;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, principal_id: &str, provider: &str) -> CommonResult<bool> {
        let key = (principal_id.to_string(), provider.to_string());
        Ok(self.tokens.write().remove(&key).is_some())
    }

    async fn list(&self, filter: &TokenFilter) -> CommonResult<Vec<EncryptedTokenRow>> {
        let mut rows: Vec<EncryptedTokenRow> =
            self.tokens.read().values().filter(|row| filter.matches(row)).cloned().collect();
        rows.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(rows)
    }

    async fn delete_where(&self, filter: &TokenFilter) -> CommonResult<usize> {
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, row| !filter.matches(row));
        Ok(before - tokens.len())
    }
}

#[async_trait]
impl StateRepository for MemoryAuthStore {
    async fn insert(&self, state: AuthState) -> CommonResult<()> {
        self.states.lock().insert(state.state.clone(), state);
        Ok(())
    }

    async fn take(&self, state: &str) -> CommonResult<Option<AuthState>> {
        Ok(self.states.lock().remove(state))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> CommonResult<usize> {
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, row| !row.is_expired_at(now));
        Ok(before - states.len())
    }
}

#[async_trait]
impl AuditRepository for MemoryAuthStore {
    async fn append(&self, event: AuditEvent) -> CommonResult<()> {
        self.audit.write().push(event);
        Ok(())
    }

    async fn list_for_principal(
        &self,
        principal_id: &str,
        limit: usize,
    ) -> CommonResult<Vec<AuditEvent>> {
        let audit = self.audit.read();
        Ok(audit
            .iter()
            .rev()
            .filter(|event| event.principal_id.as_deref() == Some(principal_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> CommonResult<usize> {
        let mut audit = self.audit.write();
        let before = audit.len();
        audit.retain(|event| event.timestamp >= cutoff);
        Ok(before - audit.len())
    }
}
