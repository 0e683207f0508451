//! Authentication service façade
//!
//! [`AuthOrchestrator`] wires the state store, token custody, lifecycle
//! manager, key rotator and both background schedulers into one service and
//! is the only surface applications talk to. Every failure leaves through
//! [`AuthenticationFailed`], whose `Display` is safe to show to end users;
//! the underlying [`AuthError`] stays available as the error source.
//!
//! ```text
//! initiate_auth ──► CsrfStateStore::create_state ──► provider URL
//! handle_callback ──► consume state ──► exchange ──► profile ──► store
//! get_valid_tokens / refresh_user / revoke_user ──► TokenLifecycleManager
//! revoke_all ──► CleanupScheduler       rotate_encryption_key ──► KeyRotator
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokenward_common::auth::{
    AuditEventType, AuditTrail, AuthError, AuthErrorKind, AuthFlowStage, CsrfStateStore,
    IdentityProvider, OAuthClient, TokenLifecycleManager, TokenRecord, TokenStore, UserProfile,
};
use tokenward_common::crypto::{EncryptionKey, KeyRotator, RotationReport, TokenCipher};
use tokenward_common::storage::{AuditRepository, MemoryAuthStore, StateRepository, TokenRepository};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::config::AuthSettings;
use crate::database::{DbManager, SqliteAuthStore};
use crate::observability::log_flow_outcome;
use crate::scheduling::{CleanupScheduler, RefreshScheduler, SchedulerError};

/// The single outward error of the authentication service
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AuthenticationFailed {
    /// Last flow stage reached before the failure
    pub stage: AuthFlowStage,
    pub kind: AuthErrorKind,
    /// End-user safe description
    pub message: String,
    #[source]
    pub source: AuthError,
}

impl AuthenticationFailed {
    pub fn new(stage: AuthFlowStage, source: AuthError) -> Self {
        Self {
            stage,
            kind: source.kind(),
            message: source.user_message().to_string(),
            source,
        }
    }
}

pub type AuthFlowResult<T> = Result<T, AuthenticationFailed>;

fn scheduler_failure(error: SchedulerError) -> AuthError {
    match error {
        SchedulerError::Auth(e) => e,
        SchedulerError::InvalidConfig(message) => AuthError::configuration(message),
        other => AuthError::server(other.to_string()),
    }
}

/// Where to send the user to sign in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub auth_url: String,
    pub state: String,
}

/// Result of a completed sign-in
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub profile: UserProfile,
    pub tokens: TokenRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving requests, but a background scheduler is stopped
    Degraded,
    /// Configuration is unusable
    Unhealthy,
}

/// Snapshot of service health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub refresh_scheduler_running: bool,
    pub cleanup_scheduler_running: bool,
    pub config_valid: bool,
    pub issues: Vec<String>,
}

/// Authentication service over one identity provider
pub struct AuthOrchestrator {
    provider: Arc<dyn IdentityProvider>,
    states: Arc<CsrfStateStore>,
    manager: Arc<TokenLifecycleManager>,
    rotator: KeyRotator,
    audit: AuditTrail,
    refresh_scheduler: AsyncMutex<RefreshScheduler>,
    cleanup_scheduler: AsyncMutex<CleanupScheduler>,
    config_issues: Vec<String>,
}

impl AuthOrchestrator {
    /// Build the service from loaded settings
    ///
    /// Uses SQLite when `database_path` is set, in-memory storage otherwise.
    ///
    /// # Errors
    /// Invalid settings (including a missing encryption key), an unusable
    /// provider registration, or a database that cannot be opened. All are
    /// reported at the `Idle` stage with kind `Configuration` or `Storage`.
    pub fn from_settings(settings: &AuthSettings) -> AuthFlowResult<Self> {
        let startup = |e: AuthError| AuthenticationFailed::new(AuthFlowStage::Idle, e);

        settings.validate().map_err(|e| startup(AuthError::configuration(e.to_string())))?;
        let key = settings
            .encryption_key()
            .map_err(|e| startup(AuthError::configuration(e.to_string())))?;
        let client = OAuthClient::with_timeout(
            settings.oauth_config().clone(),
            settings.runtime_environment(),
            settings.http_timeout(),
        )
        .map_err(startup)?;
        let provider: Arc<dyn IdentityProvider> = Arc::new(client);

        match &settings.database_path {
            Some(path) => {
                let storage = DbManager::new(path, settings.database_pool_size)
                    .and_then(|db| SqliteAuthStore::new(Arc::new(db)))
                    .map_err(|e| startup(e.into()))?;
                info!(db_path = %path.display(), "Using SQLite token storage");
                Self::new(provider, Arc::new(storage), &key, settings)
            }
            None => {
                warn!("No database_path configured, tokens are kept in memory only");
                Self::new(provider, Arc::new(MemoryAuthStore::new()), &key, settings)
            }
        }
        .map_err(startup)
    }

    /// Build the service from injected parts
    ///
    /// Settings problems are recorded and reported by
    /// [`Self::health_check`] instead of failing construction.
    ///
    /// # Errors
    /// Scheduler settings that cannot be used at all (zero interval or batch
    /// size).
    pub fn new<S>(
        provider: Arc<dyn IdentityProvider>,
        storage: Arc<S>,
        key: &EncryptionKey,
        settings: &AuthSettings,
    ) -> Result<Self, AuthError>
    where
        S: TokenRepository + StateRepository + AuditRepository + 'static,
    {
        let config_issues = match settings.validate() {
            Ok(()) => Vec::new(),
            Err(e) => vec![e.to_string()],
        };

        let audit = AuditTrail::new(storage.clone(), provider.provider_name());
        let store = Arc::new(TokenStore::new(
            storage.clone(),
            TokenCipher::new(key),
            Arc::clone(&provider),
            audit.clone(),
        ));
        let manager = Arc::new(TokenLifecycleManager::with_skew(store, settings.refresh_skew()));
        let states = Arc::new(CsrfStateStore::new(storage.clone()));
        let rotator = KeyRotator::new(storage, audit.clone());

        let refresh_scheduler =
            RefreshScheduler::new(Arc::clone(&manager), settings.refresh_scheduler_config())
                .map_err(scheduler_failure)?;
        let cleanup_scheduler = CleanupScheduler::new(
            Arc::clone(&manager),
            Arc::clone(&states),
            settings.cleanup_scheduler_config(),
        )
        .map_err(scheduler_failure)?;

        Ok(Self {
            provider,
            states,
            manager,
            rotator,
            audit,
            refresh_scheduler: AsyncMutex::new(refresh_scheduler),
            cleanup_scheduler: AsyncMutex::new(cleanup_scheduler),
            config_issues,
        })
    }

    /// Lifecycle manager, for callers that embed the service
    pub fn manager(&self) -> &Arc<TokenLifecycleManager> {
        &self.manager
    }

    /// Start a sign-in: persist a state + verifier and build the provider URL
    ///
    /// # Errors
    /// `InvalidRequest` for an unusable redirect URI, `Storage` when the
    /// state cannot be saved.
    #[instrument(skip(self))]
    pub async fn initiate_auth(&self, redirect_uri: &str) -> AuthFlowResult<AuthorizationRequest> {
        let started = Instant::now();
        let stage = AuthFlowStage::Idle;

        let pending = self
            .states
            .create_state(redirect_uri)
            .await
            .map_err(|e| flow_failed("initiate_auth", stage, started, e))?;

        let auth_url = match self.provider.build_authorization_url(
            &pending.redirect_uri,
            &pending.state,
            &pending.code_challenge,
        ) {
            Ok(url) => url,
            Err(e) => {
                // the state can never complete; drop it now
                let _ = self.states.consume(&pending.state, &pending.redirect_uri).await;
                return Err(flow_failed("initiate_auth", stage, started, e));
            }
        };

        self.audit
            .record(
                None,
                AuditEventType::AuthorizationStarted,
                json!({ "redirect_uri": pending.redirect_uri }),
            )
            .await;
        log_flow_outcome("initiate_auth", AuthFlowStage::AuthorizationRequested, started.elapsed(), None);

        Ok(AuthorizationRequest { auth_url, state: pending.state })
    }

    /// Complete a sign-in from the provider's redirect
    ///
    /// The state is consumed before anything else, so every failed callback
    /// burns it, and a replayed or tampered one fails at `CallbackReceived`
    /// and stores nothing. Tokens are
    /// persisted only after the profile is known.
    ///
    /// # Errors
    /// Failure at any stage, reported with the last stage reached.
    #[instrument(skip(self, code, state))]
    pub async fn handle_callback(
        &self,
        code: &str,
        state: &str,
        redirect_uri: &str,
    ) -> AuthFlowResult<CallbackOutcome> {
        let started = Instant::now();
        let mut stage = AuthFlowStage::CallbackReceived;

        let result: Result<CallbackOutcome, AuthError> = async {
            let pending = self.states.consume(state, redirect_uri).await?;
            if code.trim().is_empty() {
                return Err(AuthError::invalid_request("authorization code is missing"));
            }
            stage = AuthFlowStage::StateValidated;

            let tokens = self
                .provider
                .exchange_code(code, &pending.code_verifier, &pending.redirect_uri)
                .await?;
            stage = AuthFlowStage::CodeExchanged;

            let profile = self.provider.fetch_profile(&tokens.access_token).await?;
            stage = AuthFlowStage::ProfileFetched;

            let record = self.manager.store_tokens(&profile.id, &tokens).await?;
            stage = AuthFlowStage::TokensPersisted;

            Ok(CallbackOutcome { profile, tokens: record })
        }
        .await;

        match result {
            Ok(outcome) => {
                self.audit
                    .record(
                        Some(&outcome.profile.id),
                        AuditEventType::AuthorizationCompleted,
                        json!({ "scopes": outcome.tokens.scope.iter().collect::<Vec<_>>() }),
                    )
                    .await;
                log_flow_outcome("handle_callback", stage, started.elapsed(), None);
                info!(principal_id = %outcome.profile.id, "Sign-in completed");
                Ok(outcome)
            }
            Err(e) => {
                self.audit
                    .record(
                        None,
                        AuditEventType::AuthorizationFailed,
                        json!({ "stage": stage, "kind": e.kind().as_str() }),
                    )
                    .await;
                Err(flow_failed("handle_callback", stage, started, e))
            }
        }
    }

    /// A token valid for at least the refresh skew, refreshing if needed
    ///
    /// `Ok(None)` means the principal must sign in again.
    ///
    /// # Errors
    /// Transient provider failures and storage failures.
    pub async fn get_valid_tokens(&self, principal_id: &str) -> AuthFlowResult<Option<TokenRecord>> {
        self.manager
            .get_valid(principal_id)
            .await
            .map_err(|e| AuthenticationFailed::new(AuthFlowStage::Idle, e))
    }

    /// Force a refresh, sharing any refresh already running
    ///
    /// # Errors
    /// See [`Self::get_valid_tokens`].
    pub async fn refresh_user(&self, principal_id: &str) -> AuthFlowResult<Option<TokenRecord>> {
        self.manager
            .refresh(principal_id)
            .await
            .map_err(|e| AuthenticationFailed::new(AuthFlowStage::Idle, e))
    }

    /// Sign a principal out at the provider and locally
    ///
    /// # Errors
    /// Only the local delete can fail.
    pub async fn revoke_user(&self, principal_id: &str) -> AuthFlowResult<bool> {
        self.manager
            .revoke(principal_id)
            .await
            .map_err(|e| AuthenticationFailed::new(AuthFlowStage::Idle, e))
    }

    /// Revoke every stored principal, returning how many were revoked
    ///
    /// # Errors
    /// Only when the principals cannot be listed.
    pub async fn revoke_all(&self, reason: &str) -> AuthFlowResult<usize> {
        self.cleanup_scheduler
            .lock()
            .await
            .revoke_all(reason)
            .await
            .map_err(|e| AuthenticationFailed::new(AuthFlowStage::Idle, scheduler_failure(e)))
    }

    /// Re-encrypt every stored row under `new_key` and switch to it
    ///
    /// Rows written under the old key between the first pass and the switch
    /// are picked up by a second pass.
    ///
    /// # Errors
    /// Only when the rows cannot be listed.
    #[instrument(skip(self, new_key))]
    pub async fn rotate_encryption_key(&self, new_key: &EncryptionKey) -> AuthFlowResult<RotationReport> {
        let fail = |e: AuthError| AuthenticationFailed::new(AuthFlowStage::Idle, e);
        let store = self.manager.store();
        let old = store.cipher();
        let new = TokenCipher::new(new_key);

        let first = self.rotator.rotate(&old, &new, None).await.map_err(fail)?;
        store.replace_cipher(new.clone());
        let catch_up = self.rotator.rotate(&old, &new, None).await.map_err(fail)?;

        let report = RotationReport {
            rotated: first.rotated + catch_up.rotated,
            failed: catch_up.failed,
            skipped: first.skipped,
        };
        info!(
            rotated = report.rotated,
            failed = report.failed,
            skipped = report.skipped,
            key = new.key_fingerprint(),
            "Encryption key rotated"
        );
        Ok(report)
    }

    /// Start both schedulers; already running ones are left alone
    ///
    /// # Errors
    /// A scheduler that fails to start.
    pub async fn start_background(&self) -> AuthFlowResult<()> {
        let fail = |e: SchedulerError| AuthenticationFailed::new(AuthFlowStage::Idle, scheduler_failure(e));

        let mut refresh = self.refresh_scheduler.lock().await;
        if !refresh.is_running() {
            refresh.start().await.map_err(fail)?;
        }
        drop(refresh);

        let mut cleanup = self.cleanup_scheduler.lock().await;
        if !cleanup.is_running() {
            cleanup.start().await.map_err(fail)?;
        }
        Ok(())
    }

    /// Current health
    ///
    /// Unusable configuration is `Unhealthy`; a stopped scheduler is
    /// `Degraded`.
    pub async fn health_check(&self) -> HealthReport {
        let refresh_scheduler_running = self.refresh_scheduler.lock().await.is_running();
        let cleanup_scheduler_running = self.cleanup_scheduler.lock().await.is_running();
        let config_valid = self.config_issues.is_empty();

        let mut issues = self.config_issues.clone();
        if !refresh_scheduler_running {
            issues.push("refresh scheduler is not running".to_string());
        }
        if !cleanup_scheduler_running {
            issues.push("cleanup scheduler is not running".to_string());
        }

        let status = if !config_valid {
            HealthStatus::Unhealthy
        } else if refresh_scheduler_running && cleanup_scheduler_running {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            refresh_scheduler_running,
            cleanup_scheduler_running,
            config_valid,
            issues,
        }
    }

    /// Stop both schedulers; stopped ones are ignored
    ///
    /// # Errors
    /// A scheduler whose task does not finish in time.
    pub async fn shutdown(&self) -> AuthFlowResult<()> {
        let fail = |e: SchedulerError| AuthenticationFailed::new(AuthFlowStage::Idle, scheduler_failure(e));

        let refresh = self.refresh_scheduler.lock().await.stop().await;
        let cleanup = self.cleanup_scheduler.lock().await.stop().await;
        for result in [refresh, cleanup] {
            match result {
                Ok(()) | Err(SchedulerError::NotRunning) => {}
                Err(e) => return Err(fail(e)),
            }
        }
        info!("Authentication service shut down");
        Ok(())
    }
}

fn flow_failed(
    operation: &'static str,
    stage: AuthFlowStage,
    started: Instant,
    error: AuthError,
) -> AuthenticationFailed {
    log_flow_outcome(operation, stage, started.elapsed(), Some(&error));
    AuthenticationFailed::new(stage, error)
}

impl std::fmt::Debug for AuthOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthOrchestrator")
            .field("provider", &self.provider.provider_name())
            .field("manager", &self.manager)
            .field("config_issues", &self.config_issues)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for service::orchestrator.
    use tokenward_common::auth::OAuthConfig;
    use tokenward_common::testing::MockIdentityProvider;

    use super::*;

    fn settings(key: &EncryptionKey) -> AuthSettings {
        AuthSettings::new(
            OAuthConfig::for_domain("mock", "idp.mock", "client-1"),
            "https://app.example.com/callback",
            &key.to_base64(),
        )
    }

    fn orchestrator() -> (Arc<MemoryAuthStore>, Arc<MockIdentityProvider>, AuthOrchestrator) {
        let key = EncryptionKey::generate();
        let repo = Arc::new(MemoryAuthStore::new());
        let provider = Arc::new(MockIdentityProvider::new("mock"));
        let service = AuthOrchestrator::new(provider.clone(), repo.clone(), &key, &settings(&key)).unwrap();
        (repo, provider, service)
    }

    #[test]
    fn test_error_display_is_user_message() {
        let err = AuthenticationFailed::new(
            AuthFlowStage::CodeExchanged,
            AuthError::invalid_grant("refresh token reuse detected for rt-abc"),
        );
        assert_eq!(err.to_string(), "Your session has expired. Please sign in again.");
        assert_eq!(err.kind, AuthErrorKind::InvalidGrant);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_initiate_auth_returns_url_with_state() {
        let (repo, _, service) = orchestrator();
        let request = service.initiate_auth("https://app.example.com/callback").await.unwrap();

        assert!(request.auth_url.contains(&request.state));
        assert!(request.auth_url.contains("code_challenge_method=S256"));
        assert_eq!(repo.state_count(), 1);
    }

    /// Validates `AuthOrchestrator::initiate_auth` behavior for the
    /// unusable redirect scenario.
    ///
    /// Assertions:
    /// - Confirms the failure surfaces as `InvalidRequest`.
    /// - Ensures no pending state is left behind.
    #[tokio::test]
    async fn test_initiate_auth_failure_leaves_no_state() {
        let (repo, _, service) = orchestrator();
        let err = service.initiate_auth("").await.unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InvalidRequest);
        assert_eq!(repo.state_count(), 0);
    }

    /// Validates `AuthOrchestrator::handle_callback` behavior for the
    /// missing code scenario.
    ///
    /// Assertions:
    /// - Confirms the failure reports `InvalidRequest` at `CallbackReceived`.
    /// - Ensures the state is burned and cannot be retried.
    #[tokio::test]
    async fn test_missing_code_burns_state() {
        let (repo, provider, service) = orchestrator();
        let request = service.initiate_auth("https://app.example.com/callback").await.unwrap();

        let err = service
            .handle_callback("", &request.state, "https://app.example.com/callback")
            .await
            .unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InvalidRequest);
        assert_eq!(err.stage, AuthFlowStage::CallbackReceived);
        assert_eq!(repo.state_count(), 0);

        let retry = service
            .handle_callback("code-1", &request.state, "https://app.example.com/callback")
            .await
            .unwrap_err();
        assert_eq!(retry.kind, AuthErrorKind::InvalidState);
        assert_eq!(provider.exchange_calls(), 0);
        assert_eq!(repo.token_count(), 0);
    }

    #[tokio::test]
    async fn test_token_operation_failures_report_idle() {
        let (_, provider, service) = orchestrator();
        service
            .manager()
            .store_tokens("u1", &MockIdentityProvider::sample_tokens("at", Some("rt")))
            .await
            .unwrap();
        provider.fail_refresh_with(AuthError::server("502"));

        let err = service.refresh_user("u1").await.unwrap_err();
        assert_eq!(err.stage, AuthFlowStage::Idle);
        assert_eq!(err.kind, AuthErrorKind::ServerError);
    }

    /// Validates `AuthOrchestrator::handle_callback` behavior for the
    /// profile failure scenario.
    ///
    /// Assertions:
    /// - Confirms the failure reports the `CodeExchanged` stage.
    /// - Ensures no token row is written.
    #[tokio::test]
    async fn test_profile_failure_persists_nothing() {
        let (repo, provider, service) = orchestrator();
        provider.fail_profile_with(AuthError::new(AuthErrorKind::InvalidToken, "401"));
        let request = service.initiate_auth("https://app.example.com/callback").await.unwrap();

        let err = service
            .handle_callback("code-1", &request.state, "https://app.example.com/callback")
            .await
            .unwrap_err();
        assert_eq!(err.stage, AuthFlowStage::CodeExchanged);
        assert_eq!(repo.token_count(), 0);
        assert_eq!(repo.state_count(), 0);
    }

    #[tokio::test]
    async fn test_rotate_encryption_key_keeps_tokens_readable() {
        let (_, _, service) = orchestrator();
        for principal in ["a", "b"] {
            service
                .manager()
                .store_tokens(principal, &MockIdentityProvider::sample_tokens("at", Some("rt")))
                .await
                .unwrap();
        }

        let report = service.rotate_encryption_key(&EncryptionKey::generate()).await.unwrap();
        assert_eq!(report.rotated, 2);
        assert_eq!(report.failed, 0);
        assert!(service.get_valid_tokens("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_settings_report_unhealthy() {
        let key = EncryptionKey::generate();
        let mut settings = settings(&key);
        settings.redirect_uri = "ftp://nope".into();
        let service = AuthOrchestrator::new(
            Arc::new(MockIdentityProvider::new("mock")),
            Arc::new(MemoryAuthStore::new()),
            &key,
            &settings,
        )
        .unwrap();

        let report = service.health_check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.config_valid);
    }

    #[test]
    fn test_from_settings_requires_key() {
        let key = EncryptionKey::generate();
        let mut settings = settings(&key);
        settings.encryption_key = None;

        let err = AuthOrchestrator::from_settings(&settings).unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::Configuration);
        assert_eq!(err.stage, AuthFlowStage::Idle);
    }
}
