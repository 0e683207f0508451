//! Token lifecycle façade with per-principal refresh de-duplication
//!
//! Every caller that needs a usable access token goes through
//! [`TokenLifecycleManager`]. When a token is inside the refresh window the
//! manager either starts a refresh or joins the one already running for the
//! same principal, so N concurrent callers produce exactly one provider call
//! and all observe the same outcome.
//!
//! ```text
//!   caller A ──┐
//!   caller B ──┼──► in_flight[principal] ──► spawned refresh task ──► TokenStore
//!   caller C ──┘         (Shared future)          │
//!                                                 └─ guard drop removes entry
//! ```
//!
//! The refresh runs as its own task, so it completes (and the map entry is
//! cleared) even if every waiting caller is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::{AuthError, AuthResult};
use super::token_store::TokenStore;
use super::types::{ProviderTokens, TokenRecord};

/// Refresh when the access token expires within this window
pub const DEFAULT_REFRESH_SKEW_SECS: i64 = 300;

type RefreshOutcome = AuthResult<Option<TokenRecord>>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;
type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

struct InFlight {
    generation: u64,
    future: SharedRefresh,
}

/// Removes the in-flight entry when the refresh task ends, however it ends
struct InFlightGuard {
    map: InFlightMap,
    principal_id: String,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if map.get(&self.principal_id).is_some_and(|entry| entry.generation == self.generation) {
            map.remove(&self.principal_id);
        }
    }
}

/// Single entry point for reading, refreshing and revoking tokens
pub struct TokenLifecycleManager {
    store: Arc<TokenStore>,
    in_flight: InFlightMap,
    next_generation: AtomicU64,
    skew: Duration,
}

impl TokenLifecycleManager {
    /// Manager with the default 5 minute skew
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self::with_skew(store, Duration::seconds(DEFAULT_REFRESH_SKEW_SECS))
    }

    /// Manager with a custom skew
    pub fn with_skew(store: Arc<TokenStore>, skew: Duration) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            skew,
        }
    }

    /// Underlying token store
    #[must_use]
    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Configured refresh skew
    #[must_use]
    pub const fn skew(&self) -> Duration {
        self.skew
    }

    /// Number of refreshes currently running
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Persist tokens for a principal
    ///
    /// # Errors
    /// See [`TokenStore::store`].
    pub async fn store_tokens(
        &self,
        principal_id: &str,
        tokens: &ProviderTokens,
    ) -> AuthResult<TokenRecord> {
        self.store.store(principal_id, tokens).await
    }

    /// Return a token that stays valid for at least the configured skew
    ///
    /// `Ok(None)` means the principal has no usable tokens (never stored, or
    /// the grant was found dead and removed).
    ///
    /// # Errors
    /// Retryable provider failures and storage failures.
    pub async fn get_valid(&self, principal_id: &str) -> RefreshOutcome {
        self.get_valid_within(principal_id, self.skew).await
    }

    /// Same as [`Self::get_valid`] with an explicit window
    ///
    /// # Errors
    /// See [`Self::get_valid`].
    pub async fn get_valid_within(&self, principal_id: &str, window: Duration) -> RefreshOutcome {
        match self.store.load(principal_id).await? {
            None => Ok(None),
            Some(record) if record.expires_within(window, Utc::now()) => {
                debug!(
                    principal_id,
                    seconds_left = record.seconds_until_expiry(Utc::now()),
                    "Token inside refresh window"
                );
                self.join_or_start(principal_id, Some(window)).await
            }
            Some(record) => Ok(Some(record)),
        }
    }

    /// Force a de-duplicated refresh
    ///
    /// # Errors
    /// See [`Self::get_valid`].
    pub async fn refresh(&self, principal_id: &str) -> RefreshOutcome {
        self.join_or_start(principal_id, None).await
    }

    /// Revoke a principal's tokens
    ///
    /// Detaches any running refresh first and waits for it to settle, so the
    /// refresh cannot write tokens back after the delete.
    ///
    /// # Errors
    /// Only the local delete can fail the call.
    pub async fn revoke(&self, principal_id: &str) -> AuthResult<bool> {
        self.settle_in_flight(principal_id).await;
        self.store.revoke(principal_id).await
    }

    /// Delete a principal's tokens locally, without contacting the provider
    ///
    /// Same in-flight handling as [`Self::revoke`]; `reason` is recorded in
    /// the audit trail.
    ///
    /// # Errors
    /// Returns `Storage` on repository failure.
    pub async fn revoke_local(&self, principal_id: &str, reason: &str) -> AuthResult<bool> {
        self.settle_in_flight(principal_id).await;
        self.store.delete_local(principal_id, reason).await
    }

    async fn settle_in_flight(&self, principal_id: &str) {
        let detached = self.in_flight.lock().remove(principal_id);
        if let Some(entry) = detached {
            debug!(principal_id, "Waiting for in-flight refresh before revoking");
            let _ = entry.future.await;
        }
    }

    /// `window` set: the task re-reads the row and skips the provider call
    /// when another refresh already moved it out of the window.
    fn join_or_start(&self, principal_id: &str, window: Option<Duration>) -> SharedRefresh {
        let mut in_flight = self.in_flight.lock();
        if let Some(entry) = in_flight.get(principal_id) {
            debug!(principal_id, "Joining in-flight refresh");
            return entry.future.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard {
            map: Arc::clone(&self.in_flight),
            principal_id: principal_id.to_string(),
            generation,
        };
        let store = Arc::clone(&self.store);
        let principal = principal_id.to_string();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            run_refresh(&store, &principal, window).await
        });

        let future = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(AuthError::server(format!("refresh task aborted: {e}"))))
        }
        .boxed()
        .shared();

        in_flight.insert(principal_id.to_string(), InFlight { generation, future: future.clone() });
        future
    }
}

async fn run_refresh(store: &TokenStore, principal_id: &str, window: Option<Duration>) -> RefreshOutcome {
    if let Some(window) = window {
        match store.load(principal_id).await? {
            None => return Ok(None),
            Some(record) if !record.expires_within(window, Utc::now()) => {
                debug!(principal_id, "Token already renewed, skipping refresh");
                return Ok(Some(record));
            }
            Some(_) => {}
        }
    }

    match store.refresh(principal_id).await {
        Ok(record) => Ok(Some(record)),
        Err(e) if e.is_invalid_grant() => {
            warn!(principal_id, error = %e, "Refresh grant is dead, removing stored tokens");
            store.delete_local(principal_id, "invalid_grant").await?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("skew", &self.skew)
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}
