//! SQLite implementation of the token, state and audit ports
//!
//! Every call borrows a pooled connection inside `spawn_blocking`. Timestamps
//! are stored as Unix milliseconds so range predicates stay in SQL.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokenward_common::auth::audit::{AuditEvent, AuditEventType};
use tokenward_common::auth::types::{AuthState, EncryptedTokenRow};
use tokenward_common::error::{CommonError, CommonResult};
use tokenward_common::storage::{
    AuditRepository, StateRepository, TokenFilter, TokenRepository,
};
use tokio::task;
use uuid::Uuid;

use super::manager::{map_sql_error, DbManager, SqliteConnection};

/// SQLite-backed implementation of all three persistence ports
#[derive(Debug, Clone)]
pub struct SqliteAuthStore {
    db: Arc<DbManager>,
}

impl SqliteAuthStore {
    /// Wrap a manager, running migrations first
    pub fn new(db: Arc<DbManager>) -> CommonResult<Self> {
        db.run_migrations()?;
        Ok(Self { db })
    }

    /// Open a database file with a default pool
    pub fn open(path: impl AsRef<std::path::Path>) -> CommonResult<Self> {
        Self::new(Arc::new(DbManager::new(path, 4)?))
    }

    pub fn manager(&self) -> &Arc<DbManager> {
        &self.db
    }

    async fn with_connection<T, F>(&self, operation: &'static str, f: F) -> CommonResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteConnection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || -> CommonResult<T> {
            let conn = db.get_connection()?;
            f(&conn).map_err(|e| map_sql_error(operation, &e))
        })
        .await
        .map_err(|e| map_join_error(operation, &e))?
    }
}

fn map_join_error(operation: &str, err: &task::JoinError) -> CommonError {
    CommonError::internal_with_context(format!("blocking task failed: {err}"), operation)
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(idx: usize, millis: i64) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {millis}").into(),
        )
    })
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn map_token_row(row: &Row<'_>) -> Result<EncryptedTokenRow, rusqlite::Error> {
    Ok(EncryptedTokenRow {
        principal_id: row.get(0)?,
        provider: row.get(1)?,
        ciphertext: row.get(2)?,
        expires_at: from_millis(3, row.get(3)?)?,
        updated_at: from_millis(4, row.get(4)?)?,
    })
}

fn map_state_row(row: &Row<'_>) -> Result<AuthState, rusqlite::Error> {
    Ok(AuthState {
        state: row.get(0)?,
        code_verifier: row.get(1)?,
        redirect_uri: row.get(2)?,
        created_at: from_millis(3, row.get(3)?)?,
        expires_at: from_millis(4, row.get(4)?)?,
    })
}

fn map_audit_row(row: &Row<'_>) -> Result<AuditEvent, rusqlite::Error> {
    let id: String = row.get(0)?;
    let event_type: String = row.get(2)?;
    let metadata: String = row.get(4)?;
    Ok(AuditEvent {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e.to_string()))?,
        principal_id: row.get(1)?,
        event_type: AuditEventType::parse(&event_type)
            .ok_or_else(|| conversion_error(2, format!("unknown event type: {event_type}")))?,
        provider: row.get(3)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(4, e.to_string()))?,
        timestamp: from_millis(5, row.get(5)?)?,
    })
}

const TOKEN_COLUMNS: &str = "principal_id, provider, ciphertext, expires_at, updated_at";

#[async_trait]
impl TokenRepository for SqliteAuthStore {
    async fn upsert(&self, row: EncryptedTokenRow) -> CommonResult<()> {
        self.with_connection("upsert_token", move |conn| {
            conn.execute(
                "INSERT INTO token_records (principal_id, provider, ciphertext, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (principal_id, provider) DO UPDATE SET
                    ciphertext = excluded.ciphertext,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at",
                params![
                    row.principal_id,
                    row.provider,
                    row.ciphertext,
                    to_millis(row.expires_at),
                    to_millis(row.updated_at)
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get(
        &self,
        principal_id: &str,
        provider: &str,
    ) -> CommonResult<Option<EncryptedTokenRow>> {
        let principal_id = principal_id.to_string();
        let provider = provider.to_string();
        self.with_connection("get_token", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {TOKEN_COLUMNS} FROM token_records WHERE principal_id = ?1 AND provider = ?2"
                ),
                params![principal_id, provider],
                map_token_row,
            )
            .optional()
        })
        .await
    }

    async fn replace_if_unchanged(
        &self,
        row: EncryptedTokenRow,
        expected_ciphertext: &str,
    ) -> CommonResult<bool> {
        let expected = expected_ciphertext.to_string();
        self.with_connection("replace_token_if_unchanged", move |conn| {
            conn.execute(
                "UPDATE token_records
                 SET ciphertext = ?3, expires_at = ?4, updated_at = ?5
                 WHERE principal_id = ?1 AND provider = ?2 AND ciphertext = ?6",
                params![
                    row.principal_id,
                    row.provider,
                    row.ciphertext,
                    to_millis(row.expires_at),
                    to_millis(row.updated_at),
                    expected
                ],
            )
            .map(|changed| changed > 0)
        })
        .await
    }

    async fn delete(&self, principal_id: &str, provider: &str) -> CommonResult<bool> {
        let principal_id = principal_id.to_string();
        let provider = provider.to_string();
        self.with_connection("delete_token", move |conn| {
            conn.execute(
                "DELETE FROM token_records WHERE principal_id = ?1 AND provider = ?2",
                params![principal_id, provider],
            )
            .map(|changed| changed > 0)
        })
        .await
    }

    async fn list(&self, filter: &TokenFilter) -> CommonResult<Vec<EncryptedTokenRow>> {
        let filter = filter.clone();
        self.with_connection("list_tokens", move |conn| {
            let base = format!("SELECT {TOKEN_COLUMNS} FROM token_records");
            let rows = match filter {
                TokenFilter::All => {
                    let mut stmt = conn.prepare(&format!("{base} ORDER BY expires_at"))?;
                    let rows = stmt.query_map([], map_token_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
                TokenFilter::Principal(principal_id) => {
                    let mut stmt = conn
                        .prepare(&format!("{base} WHERE principal_id = ?1 ORDER BY expires_at"))?;
                    let rows = stmt.query_map(params![principal_id], map_token_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
                TokenFilter::ExpiresBefore(cutoff) => {
                    let mut stmt =
                        conn.prepare(&format!("{base} WHERE expires_at < ?1 ORDER BY expires_at"))?;
                    let rows = stmt.query_map(params![to_millis(cutoff)], map_token_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(rows)
        })
        .await
    }

    async fn delete_where(&self, filter: &TokenFilter) -> CommonResult<usize> {
        let filter = filter.clone();
        self.with_connection("delete_tokens", move |conn| match filter {
            TokenFilter::All => conn.execute("DELETE FROM token_records", []),
            TokenFilter::Principal(principal_id) => conn.execute(
                "DELETE FROM token_records WHERE principal_id = ?1",
                params![principal_id],
            ),
            TokenFilter::ExpiresBefore(cutoff) => conn.execute(
                "DELETE FROM token_records WHERE expires_at < ?1",
                params![to_millis(cutoff)],
            ),
        })
        .await
    }
}

#[async_trait]
impl StateRepository for SqliteAuthStore {
    async fn insert(&self, state: AuthState) -> CommonResult<()> {
        self.with_connection("insert_state", move |conn| {
            conn.execute(
                "INSERT INTO auth_states (state, code_verifier, redirect_uri, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    state.state,
                    state.code_verifier,
                    state.redirect_uri,
                    to_millis(state.created_at),
                    to_millis(state.expires_at)
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn take(&self, state: &str) -> CommonResult<Option<AuthState>> {
        let state = state.to_string();
        self.with_connection("take_state", move |conn| {
            conn.query_row(
                "DELETE FROM auth_states WHERE state = ?1
                 RETURNING state, code_verifier, redirect_uri, created_at, expires_at",
                params![state],
                map_state_row,
            )
            .optional()
        })
        .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> CommonResult<usize> {
        self.with_connection("delete_expired_states", move |conn| {
            conn.execute("DELETE FROM auth_states WHERE expires_at < ?1", params![to_millis(now)])
        })
        .await
    }
}

#[async_trait]
impl AuditRepository for SqliteAuthStore {
    async fn append(&self, event: AuditEvent) -> CommonResult<()> {
        let metadata = serde_json::to_string(&event.metadata)?;
        self.with_connection("append_audit", move |conn| {
            conn.execute(
                "INSERT INTO audit_events (id, principal_id, event_type, provider, metadata, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id.to_string(),
                    event.principal_id,
                    event.event_type.as_str(),
                    event.provider,
                    metadata,
                    to_millis(event.timestamp)
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn list_for_principal(
        &self,
        principal_id: &str,
        limit: usize,
    ) -> CommonResult<Vec<AuditEvent>> {
        let principal_id = principal_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_connection("list_audit", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, principal_id, event_type, provider, metadata, timestamp
                 FROM audit_events WHERE principal_id = ?1 ORDER BY seq DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![principal_id, limit], map_audit_row)?;
            rows.collect()
        })
        .await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> CommonResult<usize> {
        self.with_connection("purge_audit", move |conn| {
            conn.execute("DELETE FROM audit_events WHERE timestamp < ?1", params![to_millis(cutoff)])
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for database::sqlite_store.
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn store() -> SqliteAuthStore {
        SqliteAuthStore::new(Arc::new(DbManager::in_memory().unwrap())).unwrap()
    }

    fn row(principal: &str, expires_at: DateTime<Utc>) -> EncryptedTokenRow {
        EncryptedTokenRow {
            principal_id: principal.into(),
            provider: "google".into(),
            ciphertext: format!("blob-{principal}"),
            expires_at,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_on_principal_and_provider() {
        let store = store();
        let now = Utc::now();
        store.upsert(row("a", now)).await.unwrap();
        let mut replacement = row("a", now + Duration::hours(1));
        replacement.ciphertext = "rotated".into();
        store.upsert(replacement).await.unwrap();

        let all = store.list(&TokenFilter::All).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ciphertext, "rotated");
        assert!(store.get("a", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_if_unchanged_only_matches_current_ciphertext() {
        let store = store();
        let now = Utc::now();
        store.upsert(row("a", now)).await.unwrap();

        let mut rotated = row("a", now);
        rotated.ciphertext = "rotated".into();
        assert!(!store.replace_if_unchanged(rotated.clone(), "blob-other").await.unwrap());
        assert!(store.replace_if_unchanged(rotated.clone(), "blob-a").await.unwrap());
        assert_eq!(store.get("a", "google").await.unwrap().unwrap().ciphertext, "rotated");

        store.delete("a", "google").await.unwrap();
        assert!(!store.replace_if_unchanged(rotated, "rotated").await.unwrap());
        assert!(store.get("a", "google").await.unwrap().is_none());
    }

    /// Validates `SqliteAuthStore::list` behavior for the expiry filter
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms only rows strictly before the cutoff are listed.
    /// - Confirms `delete_where` removes the same rows.
    #[tokio::test]
    async fn test_expiry_filters() {
        let store = store();
        let now = Utc::now();
        store.upsert(row("old", now - Duration::days(10))).await.unwrap();
        store.upsert(row("soon", now + Duration::minutes(5))).await.unwrap();
        store.upsert(row("later", now + Duration::hours(5))).await.unwrap();

        let expiring = store.list(&TokenFilter::ExpiresBefore(now + Duration::minutes(10))).await.unwrap();
        let ids: Vec<_> = expiring.iter().map(|r| r.principal_id.as_str()).collect();
        assert_eq!(ids, vec!["old", "soon"]);

        let removed = store.delete_where(&TokenFilter::ExpiresBefore(now - Duration::days(7))).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.delete("soon", "google").await.unwrap());
        assert!(!store.delete("soon", "google").await.unwrap());
    }

    #[tokio::test]
    async fn test_take_removes_state() {
        let store = store();
        let now = Utc::now();
        store
            .insert(AuthState {
                state: "s1".into(),
                code_verifier: "verifier".into(),
                redirect_uri: "https://app/cb".into(),
                created_at: now,
                expires_at: now + Duration::minutes(10),
            })
            .await
            .unwrap();

        let taken = store.take("s1").await.unwrap().unwrap();
        assert_eq!(taken.code_verifier, "verifier");
        assert!(store.take("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_audit_history_newest_first() {
        let store = store();
        for kind in [AuditEventType::TokenStored, AuditEventType::TokenRefreshed] {
            store.append(AuditEvent::new(Some("u1"), kind, "google", json!({"n": 1}))).await.unwrap();
        }
        store
            .append(AuditEvent::new(None, AuditEventType::TokensRevokedAll, "google", json!({})))
            .await
            .unwrap();

        let history = store.list_for_principal("u1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, AuditEventType::TokenRefreshed);
        assert_eq!(history[1].metadata, json!({"n": 1}));

        let purged = store.delete_older_than(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(purged, 3);
    }
}
