//! Periodic housekeeping for token custody.
//!
//! Every tick removes three kinds of stale data, each independently so that
//! one failing delete does not stop the others:
//! - token rows expired for longer than the grace period
//! - authorization states past their lifetime
//! - audit events older than the retention period
//!
//! Ticks outside the optional maintenance window are skipped. The scheduler
//! also owns the bulk revocation used for emergency sign-out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokenward_common::auth::{AuditEventType, AuditTrail, CsrfStateStore, TokenLifecycleManager};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::scheduling::error::{SchedulerError, SchedulerResult};

type TaskHandle = Arc<AsyncMutex<Option<JoinHandle<()>>>>;

/// Hours of the day (UTC) during which cleanup may run
///
/// `start_hour > end_hour` wraps past midnight, so `22..3` covers
/// 22:00 through 02:59. Equal hours leave the window always open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl MaintenanceWindow {
    /// # Errors
    /// Returns `InvalidConfig` when either hour is 24 or more.
    pub fn new(start_hour: u8, end_hour: u8) -> SchedulerResult<Self> {
        let window = Self { start_hour, end_hour };
        window.validate()?;
        Ok(window)
    }

    fn validate(&self) -> SchedulerResult<()> {
        if self.start_hour >= 24 || self.end_hour >= 24 {
            return Err(SchedulerError::InvalidConfig(format!(
                "maintenance window hours must be below 24, got {}..{}",
                self.start_hour, self.end_hour
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, hour: u32) -> bool {
        let (start, end) = (u32::from(self.start_hour), u32::from(self.end_hour));
        match start.cmp(&end) {
            std::cmp::Ordering::Less => hour >= start && hour < end,
            std::cmp::Ordering::Greater => hour >= start || hour < end,
            std::cmp::Ordering::Equal => true,
        }
    }
}

/// Configuration for the cleanup scheduler
#[derive(Debug, Clone)]
pub struct CleanupSchedulerConfig {
    pub interval: Duration,
    /// Expired token rows are kept this long before deletion
    pub grace_period: chrono::Duration,
    pub audit_retention: chrono::Duration,
    pub maintenance_window: Option<MaintenanceWindow>,
    /// Principals revoked concurrently by `revoke_all`
    pub revoke_batch_size: usize,
}

impl Default for CleanupSchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            grace_period: chrono::Duration::days(7),
            audit_retention: chrono::Duration::days(90),
            maintenance_window: None,
            revoke_batch_size: 10,
        }
    }
}

impl CleanupSchedulerConfig {
    fn validate(&self) -> SchedulerResult<()> {
        if self.interval.is_zero() {
            return Err(SchedulerError::InvalidConfig("interval must be positive".into()));
        }
        if self.revoke_batch_size == 0 {
            return Err(SchedulerError::InvalidConfig("revoke_batch_size must be positive".into()));
        }
        if self.grace_period < chrono::Duration::zero()
            || self.audit_retention < chrono::Duration::zero()
        {
            return Err(SchedulerError::InvalidConfig("retention periods must not be negative".into()));
        }
        if let Some(window) = &self.maintenance_window {
            window.validate()?;
        }
        Ok(())
    }
}

/// Counters for one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub tokens_deleted: usize,
    pub states_deleted: usize,
    pub audit_deleted: usize,
    /// Deletes that failed during this pass
    pub failures: usize,
}

struct CleanupWorker {
    manager: Arc<TokenLifecycleManager>,
    states: Arc<CsrfStateStore>,
    audit: AuditTrail,
    config: CleanupSchedulerConfig,
}

impl CleanupWorker {
    async fn run_pass(&self) -> CleanupStats {
        let mut stats = CleanupStats::default();

        match self.manager.store().sweep_expired(self.config.grace_period).await {
            Ok(count) => stats.tokens_deleted = count,
            Err(e) => {
                stats.failures += 1;
                error!(error = %e, "Expired token cleanup failed");
            }
        }

        match self.states.sweep_expired().await {
            Ok(count) => stats.states_deleted = count,
            Err(e) => {
                stats.failures += 1;
                error!(error = %e, "Expired state cleanup failed");
            }
        }

        let cutoff = Utc::now() - self.config.audit_retention;
        match self.audit.purge_before(cutoff).await {
            Ok(count) => stats.audit_deleted = count,
            Err(e) => {
                stats.failures += 1;
                error!(error = %e, "Audit retention cleanup failed");
            }
        }

        info!(
            tokens = stats.tokens_deleted,
            states = stats.states_deleted,
            audit = stats.audit_deleted,
            failures = stats.failures,
            "Cleanup pass finished"
        );
        stats
    }

    fn in_window(&self) -> bool {
        self.config.maintenance_window.map_or(true, |w| w.contains(Utc::now().hour()))
    }
}

/// Background cleanup scheduler
pub struct CleanupScheduler {
    worker: Arc<CleanupWorker>,
    cancellation_token: CancellationToken,
    task_handle: TaskHandle,
}

impl CleanupScheduler {
    /// # Errors
    /// Returns `InvalidConfig` for a zero interval or batch size, negative
    /// retention, or an out-of-range maintenance window.
    pub fn new(
        manager: Arc<TokenLifecycleManager>,
        states: Arc<CsrfStateStore>,
        config: CleanupSchedulerConfig,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let audit = manager.store().audit().clone();
        Ok(Self {
            worker: Arc::new(CleanupWorker { manager, states, audit, config }),
            cancellation_token: CancellationToken::new(),
            task_handle: Arc::new(AsyncMutex::new(None)),
        })
    }

    pub fn config(&self) -> &CleanupSchedulerConfig {
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

        info!(interval_secs = self.worker.config.interval.as_secs(), "Starting cleanup scheduler");

        self.cancellation_token = CancellationToken::new();
        let worker = Arc::clone(&self.worker);
        let cancel = self.cancellation_token.clone();

        let handle = tokio::spawn(async move {
            Self::cleanup_loop(worker, cancel).await;
        });

        *self.task_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the scheduler gracefully
    ///
    /// # Errors
    ///
    /// Returns error if scheduler is not running
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }

        info!("Stopping cleanup scheduler");
        self.cancellation_token.cancel();

        if let Some(handle) = self.task_handle.lock().await.take() {
            let join_timeout = Duration::from_secs(5);
            tokio::time::timeout(join_timeout, handle)
                .await
                .map_err(|source| SchedulerError::Timeout { duration: join_timeout, source })??;
        }

        info!("Cleanup scheduler stopped");
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

    /// Run one cleanup pass now, ignoring the maintenance window
    pub async fn run_once(&self) -> CleanupStats {
        self.worker.run_pass().await
    }

    /// Revoke every stored principal, in batches
    ///
    /// Each principal settles independently; failures are logged and counted
    /// but never abort the rest. Returns the number of principals revoked.
    ///
    /// # Errors
    /// Fails only when the principal listing fails.
    #[instrument(skip(self))]
    pub async fn revoke_all(&self, reason: &str) -> SchedulerResult<usize> {
        let principals = self.worker.manager.store().principals().await?;
        let mut revoked = 0usize;
        let mut failed = 0usize;

        for batch in principals.chunks(self.worker.config.revoke_batch_size) {
            let results =
                join_all(batch.iter().map(|p| self.worker.manager.revoke(p.as_str()))).await;
            for (principal_id, result) in batch.iter().zip(results) {
                match result {
                    Ok(true) => revoked += 1,
                    Ok(false) => debug!(principal_id = %principal_id, "Nothing to revoke"),
                    Err(e) => {
                        failed += 1;
                        warn!(principal_id = %principal_id, error = %e, "Revocation failed");
                    }
                }
            }
        }

        info!(revoked, failed, reason, "Bulk revocation finished");
        self.worker
            .audit
            .record(
                None,
                AuditEventType::TokensRevokedAll,
                json!({ "reason": reason, "revoked": revoked, "failed": failed }),
            )
            .await;
        Ok(revoked)
    }

    async fn cleanup_loop(worker: Arc<CleanupWorker>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Cleanup loop cancelled");
                    break;
                }
                () = tokio::time::sleep(worker.config.interval) => {
                    if worker.in_window() {
                        tokio::select! {
                            () = cancel.cancelled() => {
                                debug!("Cleanup pass interrupted by shutdown");
                                break;
                            }
                            _ = worker.run_pass() => {}
                        }
                    } else {
                        debug!("Outside maintenance window, skipping cleanup");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for CleanupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScheduler")
            .field("config", &self.worker.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() {
            self.cancellation_token.cancel();
        }
    }
}
