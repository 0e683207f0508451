//! Persistence ports for token rows, pending authorizations and audit events
//!
//! The auth stack never talks to a database directly. It depends on these
//! three traits, which adapters implement:
//!
//! - [`memory::MemoryAuthStore`]: in-process maps (tests, single-node use)
//! - `tokenward_infra::database::SqliteAuthStore`: rusqlite + r2d2
//!
//! Every method is a single row-level atomic operation. In particular
//! [`StateRepository::take`] must read and delete in one step so a state can
//! never be consumed twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::audit::AuditEvent;
use crate::auth::types::{AuthState, EncryptedTokenRow};
use crate::error::CommonResult;

pub mod memory;

pub use memory::MemoryAuthStore;

/// Row selector for bulk token operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenFilter {
    /// Every stored row
    All,
    /// Rows belonging to one principal
    Principal(String),
    /// Rows whose `expires_at` is strictly before the instant
    ExpiresBefore(DateTime<Utc>),
}

impl TokenFilter {
    /// Evaluate the filter against a row
    #[must_use]
    pub fn matches(&self, row: &EncryptedTokenRow) -> bool {
        match self {
            Self::All => true,
            Self::Principal(principal_id) => row.principal_id == *principal_id,
            Self::ExpiresBefore(cutoff) => row.expires_at < *cutoff,
        }
    }
}

/// Encrypted token rows keyed by `(principal_id, provider)`
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Insert or replace the row for `(principal_id, provider)`
    async fn upsert(&self, row: EncryptedTokenRow) -> CommonResult<()>;

    /// Fetch one row
    async fn get(&self, principal_id: &str, provider: &str)
        -> CommonResult<Option<EncryptedTokenRow>>;

    /// Replace the row only while its stored ciphertext still equals
    /// `expected_ciphertext`
    ///
    /// Returns `false` when the row was changed or deleted in the meantime;
    /// nothing is written in that case.
    async fn replace_if_unchanged(
        &self,
        row: EncryptedTokenRow,
        expected_ciphertext: &str,
    ) -> CommonResult<bool>;

    /// Delete one row, returning whether it existed
    async fn delete(&self, principal_id: &str, provider: &str) -> CommonResult<bool>;

    /// List rows matching `filter`
    async fn list(&self, filter: &TokenFilter) -> CommonResult<Vec<EncryptedTokenRow>>;

    /// Delete rows matching `filter`, returning how many were removed
    async fn delete_where(&self, filter: &TokenFilter) -> CommonResult<usize>;
}

/// Pending authorizations keyed by state value
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Persist a new pending authorization
    async fn insert(&self, state: AuthState) -> CommonResult<()>;

    /// Atomically fetch and delete the row for `state`
    async fn take(&self, state: &str) -> CommonResult<Option<AuthState>>;

    /// Delete rows that expired before `now`
    async fn delete_expired(&self, now: DateTime<Utc>) -> CommonResult<usize>;
}

/// Append-only audit log
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Append one event
    async fn append(&self, event: AuditEvent) -> CommonResult<()>;

    /// Most recent events for a principal, newest first
    async fn list_for_principal(
        &self,
        principal_id: &str,
        limit: usize,
    ) -> CommonResult<Vec<AuditEvent>>;

    /// Delete events recorded before `cutoff`
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> CommonResult<usize>;
}
