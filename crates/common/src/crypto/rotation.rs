//! Re-encryption of stored token rows under a new key
//!
//! Rows are processed in batches of [`ROTATION_BATCH_SIZE`]; the rows inside
//! a batch run concurrently. A row that fails to decrypt or write is counted
//! and logged, and the rotation moves on.
//!
//! Rows are written back only if their stored ciphertext is still the one
//! that was read, so a concurrent revoke or refresh is never undone.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::encryption::TokenCipher;
use crate::auth::audit::{AuditEventType, AuditTrail};
use crate::auth::error::AuthResult;
use crate::auth::types::EncryptedTokenRow;
use crate::storage::{TokenFilter, TokenRepository};

pub const ROTATION_BATCH_SIZE: usize = 10;

/// Outcome counts of one rotation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Rows re-encrypted under the new key
    pub rotated: usize,
    /// Rows that could not be decrypted with either key, or not written
    pub failed: usize,
    /// Rows already readable with the new key, or revoked or rewritten
    /// while the pass ran
    pub skipped: usize,
}

impl RotationReport {
    #[must_use]
    pub const fn total(&self) -> usize {
        self.rotated + self.failed + self.skipped
    }

    /// Sum two passes
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            rotated: self.rotated + other.rotated,
            failed: self.failed + other.failed,
            skipped: self.skipped + other.skipped,
        }
    }
}

enum RowOutcome {
    Rotated,
    Failed,
    Skipped,
}

/// Batch re-encryption over a token repository
#[derive(Clone)]
pub struct KeyRotator {
    repository: Arc<dyn TokenRepository>,
    audit: AuditTrail,
}

impl KeyRotator {
    pub fn new(repository: Arc<dyn TokenRepository>, audit: AuditTrail) -> Self {
        Self { repository, audit }
    }

    /// Re-encrypt every row (or one principal's rows) from `old` to `new`
    ///
    /// # Errors
    /// Only the initial listing can fail the call; per-row failures are
    /// reported in [`RotationReport::failed`].
    #[instrument(skip(self, old, new), fields(from = old.key_fingerprint(), to = new.key_fingerprint()))]
    pub async fn rotate(
        &self,
        old: &TokenCipher,
        new: &TokenCipher,
        principal_id: Option<&str>,
    ) -> AuthResult<RotationReport> {
        let filter = principal_id.map_or(TokenFilter::All, |p| TokenFilter::Principal(p.to_string()));
        let rows = self.repository.list(&filter).await?;
        let mut report = RotationReport::default();

        for batch in rows.chunks(ROTATION_BATCH_SIZE) {
            let outcomes = join_all(batch.iter().map(|row| self.rotate_row(row, old, new))).await;
            for outcome in outcomes {
                match outcome {
                    RowOutcome::Rotated => report.rotated += 1,
                    RowOutcome::Failed => report.failed += 1,
                    RowOutcome::Skipped => report.skipped += 1,
                }
            }
        }

        info!(
            rotated = report.rotated,
            failed = report.failed,
            skipped = report.skipped,
            "Key rotation pass finished"
        );
        self.audit
            .record(
                principal_id,
                AuditEventType::KeyRotated,
                json!({
                    "from": old.key_fingerprint(),
                    "to": new.key_fingerprint(),
                    "rotated": report.rotated,
                    "failed": report.failed,
                    "skipped": report.skipped,
                }),
            )
            .await;
        Ok(report)
    }

    async fn rotate_row(
        &self,
        row: &EncryptedTokenRow,
        old: &TokenCipher,
        new: &TokenCipher,
    ) -> RowOutcome {
        let ciphertext = match old.reencrypt(&row.ciphertext, new) {
            Ok(ciphertext) => ciphertext,
            Err(_) if new.decrypt(&row.ciphertext).is_ok() => return RowOutcome::Skipped,
            Err(e) => {
                warn!(principal_id = %row.principal_id, error = %e, "Row unreadable during key rotation");
                return RowOutcome::Failed;
            }
        };

        let updated = EncryptedTokenRow { ciphertext, updated_at: Utc::now(), ..row.clone() };
        match self.repository.replace_if_unchanged(updated, &row.ciphertext).await {
            Ok(true) => RowOutcome::Rotated,
            Ok(false) => {
                debug!(principal_id = %row.principal_id, "Row changed during key rotation, left as written");
                RowOutcome::Skipped
            }
            Err(e) => {
                warn!(principal_id = %row.principal_id, error = %e, "Failed to write rotated row");
                RowOutcome::Failed
            }
        }
    }
}

impl std::fmt::Debug for KeyRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRotator").finish_non_exhaustive()
    }
}
