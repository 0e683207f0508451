//! Proactive token refresh on a fixed interval.
//!
//! Each tick lists principals whose access token expires within the refresh
//! buffer and renews them through the lifecycle manager, so sweeps share the
//! same per-principal de-duplication as on-demand callers. Principals are
//! processed in small concurrent batches.
//!
//! Retry policy per principal:
//! - retryable failure (`NetworkError`, `ServerError`): wait
//!   `base_delay * 2^attempt`, up to `max_retries` retries
//! - retries exhausted: tokens deleted locally, retry entry cleared
//! - dead grant or other non-retryable failure: tokens deleted at once
//!
//! Stopping the scheduler interrupts a sweep between batches and during
//! backoff; principals caught mid-retry keep their tokens.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokenward_common::auth::TokenLifecycleManager;
//! use tokenward_infra::scheduling::{RefreshScheduler, RefreshSchedulerConfig};
//!
//! # async fn example(manager: Arc<TokenLifecycleManager>) -> Result<(), Box<dyn std::error::Error>> {
//! let mut scheduler = RefreshScheduler::new(manager, RefreshSchedulerConfig::default())?;
//! scheduler.start().await?;
//! // ... application runs ...
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokenward_common::auth::{AuthError, AuthErrorKind, AuthResult, TokenLifecycleManager, TokenRecord};
use tokenward_common::error::ErrorClassification;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::scheduling::error::{SchedulerError, SchedulerResult};

type TaskHandle = Arc<AsyncMutex<Option<JoinHandle<()>>>>;
type RetryMap = Arc<Mutex<HashMap<String, RetryState>>>;

/// Configuration for the refresh scheduler
#[derive(Debug, Clone)]
pub struct RefreshSchedulerConfig {
    /// Sweep interval
    pub interval: Duration,
    /// Refresh tokens whose remaining lifetime is below this
    pub refresh_buffer: chrono::Duration,
    /// Principals refreshed concurrently per batch
    pub batch_size: usize,
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// First backoff delay, doubled on every retry
    pub base_delay: Duration,
}

impl Default for RefreshSchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            refresh_buffer: chrono::Duration::minutes(10),
            batch_size: 5,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RefreshSchedulerConfig {
    fn validate(&self) -> SchedulerResult<()> {
        if self.interval.is_zero() {
            return Err(SchedulerError::InvalidConfig("interval must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(SchedulerError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.refresh_buffer <= chrono::Duration::zero() {
            return Err(SchedulerError::InvalidConfig("refresh_buffer must be positive".into()));
        }
        Ok(())
    }
}

/// Retry bookkeeping for one principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Retries performed so far
    pub attempts: u32,
    pub last_error: AuthErrorKind,
    pub next_attempt_at: DateTime<Utc>,
}

/// Result of refreshing one principal within a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Grant dead or non-retryable failure; tokens deleted
    Revoked,
    /// Retry budget spent; tokens deleted
    Exhausted,
    /// Storage failure; left for the next sweep
    Failed,
}

/// Counters for one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSweepStats {
    pub candidates: usize,
    pub refreshed: usize,
    pub revoked: usize,
    pub exhausted: usize,
    pub failed: usize,
    /// Candidates not settled because the scheduler stopped
    pub cancelled: usize,
}

impl RefreshSweepStats {
    fn record(&mut self, outcome: RefreshOutcome) {
        match outcome {
            RefreshOutcome::Refreshed => self.refreshed += 1,
            RefreshOutcome::Revoked => self.revoked += 1,
            RefreshOutcome::Exhausted => self.exhausted += 1,
            RefreshOutcome::Failed => self.failed += 1,
        }
    }
}

/// `base * 2^attempt`, saturating
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
}

/// State shared between the scheduler handle and its background loop
struct RefreshWorker {
    manager: Arc<TokenLifecycleManager>,
    config: RefreshSchedulerConfig,
    retries: RetryMap,
}

impl RefreshWorker {
    async fn sweep(&self, cancel: &CancellationToken) -> SchedulerResult<RefreshSweepStats> {
        let candidates =
            self.manager.store().principals_expiring_within(self.config.refresh_buffer).await?;
        let mut stats = RefreshSweepStats { candidates: candidates.len(), ..Default::default() };
        if candidates.is_empty() {
            debug!("No tokens inside the refresh buffer");
            return Ok(stats);
        }

        info!(count = candidates.len(), "Refreshing expiring tokens");
        for batch in candidates.chunks(self.config.batch_size) {
            let outcomes = tokio::select! {
                () = cancel.cancelled() => {
                    info!("Refresh sweep interrupted by shutdown");
                    stats.cancelled = stats.candidates
                        - (stats.refreshed + stats.revoked + stats.exhausted + stats.failed);
                    let mut retries = self.retries.lock();
                    for principal_id in &candidates {
                        retries.remove(principal_id);
                    }
                    break;
                }
                outcomes = join_all(batch.iter().map(|p| self.refresh_with_retry(p))) => outcomes,
            };
            for outcome in outcomes {
                stats.record(outcome);
            }
        }

        info!(
            refreshed = stats.refreshed,
            revoked = stats.revoked,
            exhausted = stats.exhausted,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "Refresh sweep finished"
        );
        Ok(stats)
    }

    async fn refresh_with_retry(&self, principal_id: &str) -> RefreshOutcome {
        let mut attempt: u32 = 0;
        loop {
            let error = match self
                .manager
                .get_valid_within(principal_id, self.config.refresh_buffer)
                .await
            {
                Ok(Some(_)) => {
                    self.retries.lock().remove(principal_id);
                    return RefreshOutcome::Refreshed;
                }
                Ok(None) => {
                    self.retries.lock().remove(principal_id);
                    info!(principal_id, "Refresh grant dead, principal must sign in again");
                    return RefreshOutcome::Revoked;
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                self.retries.lock().remove(principal_id);
                if error.kind() == AuthErrorKind::Storage {
                    warn!(principal_id, error = %error, "Refresh skipped after storage failure");
                    return RefreshOutcome::Failed;
                }
                warn!(principal_id, error = %error, "Non-retryable refresh failure, revoking locally");
                self.revoke_locally(principal_id, error.kind().as_str()).await;
                return RefreshOutcome::Revoked;
            }

            if attempt >= self.config.max_retries {
                let exhausted = AuthError::new(
                    AuthErrorKind::RefreshExhausted,
                    format!("gave up after {attempt} retries"),
                )
                .with_context(error.kind().as_str());
                error!(principal_id, error = %exhausted, "Refresh retries exhausted, revoking locally");
                self.retries.lock().remove(principal_id);
                self.revoke_locally(principal_id, AuthErrorKind::RefreshExhausted.as_str()).await;
                return RefreshOutcome::Exhausted;
            }

            let delay = backoff_delay(self.config.base_delay, attempt);
            attempt += 1;
            let next_attempt_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.retries.lock().insert(
                principal_id.to_string(),
                RetryState { attempts: attempt, last_error: error.kind(), next_attempt_at },
            );
            warn!(
                principal_id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Refresh failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn revoke_locally(&self, principal_id: &str, reason: &str) {
        if let Err(e) = self.manager.revoke_local(principal_id, reason).await {
            error!(principal_id, error = %e, "Failed to delete tokens after refresh failure");
        }
    }
}

/// Background refresh scheduler
pub struct RefreshScheduler {
    worker: Arc<RefreshWorker>,
    cancellation_token: CancellationToken,
    task_handle: TaskHandle,
}

impl RefreshScheduler {
    /// Create a scheduler
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a zero interval, batch size or buffer.
    pub fn new(
        manager: Arc<TokenLifecycleManager>,
        config: RefreshSchedulerConfig,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        Ok(Self {
            worker: Arc::new(RefreshWorker {
                manager,
                config,
                retries: Arc::new(Mutex::new(HashMap::new())),
            }),
            cancellation_token: CancellationToken::new(),
            task_handle: Arc::new(AsyncMutex::new(None)),
        })
    }

    pub fn config(&self) -> &RefreshSchedulerConfig {
        &self.worker.config
    }

    /// Start the scheduler
    ///
    /// # Errors
    ///
    /// Returns error if scheduler is already running
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        info!(interval_secs = self.worker.config.interval.as_secs(), "Starting refresh scheduler");

        self.cancellation_token = CancellationToken::new();
        let worker = Arc::clone(&self.worker);
        let cancel = self.cancellation_token.clone();

        let handle = tokio::spawn(async move {
            Self::refresh_loop(worker, cancel).await;
        });

        *self.task_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the scheduler gracefully
    ///
    /// Cancels the background task and awaits completion. A sweep already in
    /// progress finishes first.
    ///
    /// # Errors
    ///
    /// Returns error if scheduler is not running
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }

        info!("Stopping refresh scheduler");
        self.cancellation_token.cancel();

        if let Some(handle) = self.task_handle.lock().await.take() {
            let join_timeout = Duration::from_secs(5);
            tokio::time::timeout(join_timeout, handle)
                .await
                .map_err(|source| SchedulerError::Timeout { duration: join_timeout, source })??;
        }

        info!("Refresh scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is running
    pub fn is_running(&self) -> bool {
        self.task_handle
            .try_lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Run one sweep immediately
    ///
    /// Independent of the background loop; `stop` does not interrupt it.
    ///
    /// # Errors
    /// Fails only when the candidate listing fails.
    pub async fn run_once(&self) -> SchedulerResult<RefreshSweepStats> {
        self.worker.sweep(&CancellationToken::new()).await
    }

    /// On-demand refresh of one principal, without retries
    ///
    /// # Errors
    /// See [`TokenLifecycleManager::refresh`].
    pub async fn refresh_one(&self, principal_id: &str) -> AuthResult<Option<TokenRecord>> {
        self.worker.manager.refresh(principal_id).await
    }

    /// Current retry bookkeeping for `principal_id`
    pub fn retry_state(&self, principal_id: &str) -> Option<RetryState> {
        self.worker.retries.lock().get(principal_id).cloned()
    }

    /// Number of principals currently in backoff
    pub fn pending_retries(&self) -> usize {
        self.worker.retries.lock().len()
    }

    async fn refresh_loop(worker: Arc<RefreshWorker>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Refresh loop cancelled");
                    break;
                }
                () = tokio::time::sleep(worker.config.interval) => {
                    if let Err(e) = worker.sweep(&cancel).await {
                        error!(error = %e, "Refresh sweep failed");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("config", &self.worker.config)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Ensure scheduler is stopped when dropped
impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() {
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for scheduling::refresh_scheduler.
    use tokenward_common::auth::{AuditTrail, TokenStore};
    use tokenward_common::crypto::{EncryptionKey, TokenCipher};
    use tokenward_common::storage::MemoryAuthStore;
    use tokenward_common::testing::MockIdentityProvider;

    use super::*;

    struct Fixture {
        repo: Arc<MemoryAuthStore>,
        provider: Arc<MockIdentityProvider>,
        manager: Arc<TokenLifecycleManager>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryAuthStore::new());
        let provider = Arc::new(MockIdentityProvider::new("mock"));
        let store = Arc::new(TokenStore::new(
            repo.clone(),
            TokenCipher::new(&EncryptionKey::generate()),
            provider.clone(),
            AuditTrail::new(repo.clone(), "mock"),
        ));
        Fixture { repo, provider, manager: Arc::new(TokenLifecycleManager::new(store)) }
    }

    async fn store_expiring(f: &Fixture, principal: &str, in_secs: i64) {
        f.manager
            .store_tokens(
                principal,
                &MockIdentityProvider::sample_tokens_expiring(
                    "old",
                    Some("rt"),
                    Utc::now() + chrono::Duration::seconds(in_secs),
                ),
            )
            .await
            .unwrap();
    }

    fn scheduler(f: &Fixture) -> RefreshScheduler {
        RefreshScheduler::new(Arc::clone(&f.manager), RefreshSchedulerConfig::default()).unwrap()
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(250));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 40), base.saturating_mul(u32::MAX));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let f = fixture();
        let config = RefreshSchedulerConfig { batch_size: 0, ..Default::default() };
        assert!(matches!(
            RefreshScheduler::new(f.manager, config),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    /// Validates `RefreshScheduler::run_once` behavior for the buffer
    /// selection scenario.
    ///
    /// Assertions:
    /// - Confirms only tokens inside the 10 minute buffer are refreshed.
    #[tokio::test]
    async fn test_sweep_refreshes_only_expiring_tokens() {
        let f = fixture();
        store_expiring(&f, "soon", 120).await;
        store_expiring(&f, "later", 3600).await;

        let stats = scheduler(&f).run_once().await.unwrap();
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.refreshed, 1);
        assert_eq!(f.provider.refresh_calls(), 1);
    }

    /// Validates `RefreshScheduler::run_once` behavior for the permanent
    /// network failure scenario.
    ///
    /// Assertions:
    /// - Confirms exactly `max_retries` retries after the first attempt.
    /// - Confirms the gaps between attempts strictly increase.
    /// - Ensures the tokens are deleted and the retry entry cleared.
    #[tokio::test(start_paused = true)]
    async fn test_backoff_terminates_with_local_revoke() {
        let f = fixture();
        store_expiring(&f, "u1", 60).await;
        f.provider.fail_refresh_with(AuthError::network("connection refused"));

        let scheduler = scheduler(&f);
        let stats = scheduler.run_once().await.unwrap();

        assert_eq!(stats.exhausted, 1);
        assert_eq!(f.provider.refresh_calls(), 4);
        let instants = f.provider.refresh_instants();
        let gaps: Vec<_> = instants.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);
        assert_eq!(f.repo.token_count(), 0);
        assert!(scheduler.retry_state("u1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let f = fixture();
        store_expiring(&f, "u1", 60).await;
        f.provider.fail_refresh_times(2, AuthError::server("503"));

        let scheduler = scheduler(&f);
        let stats = scheduler.run_once().await.unwrap();
        assert_eq!(stats.refreshed, 1);
        assert_eq!(f.provider.refresh_calls(), 3);
        assert_eq!(f.repo.token_count(), 1);
        assert_eq!(scheduler.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_state_visible_during_backoff() {
        let f = fixture();
        store_expiring(&f, "u1", 60).await;
        f.provider.fail_refresh_with(AuthError::network("down"));

        let scheduler = Arc::new(scheduler(&f));
        let sweep = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_once().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;

        let state = scheduler.retry_state("u1").unwrap();
        assert_eq!(state.attempts, 1);
        assert_eq!(state.last_error, AuthErrorKind::NetworkError);

        sweep.await.unwrap().unwrap();
        assert!(scheduler.retry_state("u1").is_none());
    }

    /// A dead refresh token is never retried.
    #[tokio::test]
    async fn test_invalid_grant_revokes_without_retry() {
        let f = fixture();
        store_expiring(&f, "u1", 60).await;
        f.provider.fail_refresh_with(AuthError::invalid_grant("revoked"));

        let scheduler = scheduler(&f);
        let stats = scheduler.run_once().await.unwrap();
        assert_eq!(stats.revoked, 1);
        assert_eq!(f.provider.refresh_calls(), 1);
        assert_eq!(f.repo.token_count(), 0);
        assert!(scheduler.retry_state("u1").is_none());
    }

    #[tokio::test]
    async fn test_refresh_one_bypasses_buffer() {
        let f = fixture();
        store_expiring(&f, "u1", 7200).await;

        let record = scheduler(&f).refresh_one("u1").await.unwrap().unwrap();
        assert_eq!(record.access_token, "refreshed-1");
    }

    /// Validates `RefreshScheduler::stop` behavior for the stop during
    /// backoff scenario.
    ///
    /// Assertions:
    /// - Confirms `stop` returns promptly instead of timing out.
    /// - Ensures the principal is neither retried nor revoked afterwards.
    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff() {
        let f = fixture();
        store_expiring(&f, "u1", 60).await;
        f.provider.fail_refresh_with(AuthError::network("down"));
        let config = RefreshSchedulerConfig {
            interval: Duration::from_secs(1),
            base_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let mut scheduler = RefreshScheduler::new(Arc::clone(&f.manager), config).unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(scheduler.pending_retries(), 1);

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.pending_retries(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.provider.refresh_calls(), 1);
        assert_eq!(f.repo.token_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduler_lifecycle() {
        let f = fixture();
        let mut scheduler = scheduler(&f);

        assert!(!scheduler.is_running());
        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
    }
}
