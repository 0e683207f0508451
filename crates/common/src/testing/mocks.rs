//! Mock implementations of the auth seams
//!
//! [`MockIdentityProvider`] stands in for the HTTP client: responses are
//! scripted, every call is counted, and latency can be injected to exercise
//! refresh de-duplication. [`FailingTokenRepository`] wraps a real repository
//! and fails selected principals, for partial-failure sweeps.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::auth::error::{AuthError, AuthResult};
use crate::auth::traits::IdentityProvider;
use crate::auth::types::{EncryptedTokenRow, ProviderTokens, ScopeSet, UserProfile};
use crate::error::{CommonError, CommonResult};
use crate::storage::{TokenFilter, TokenRepository};

#[derive(Default)]
struct MockState {
    exchange_response: Option<ProviderTokens>,
    refresh_response: Option<ProviderTokens>,
    profile: Option<UserProfile>,
    exchange_failure: Option<AuthError>,
    refresh_failure: Option<AuthError>,
    scripted_refresh_failures: VecDeque<AuthError>,
    profile_failure: Option<AuthError>,
    revoke_failure: Option<AuthError>,
    refresh_delay: Option<StdDuration>,
    refresh_instants: Vec<tokio::time::Instant>,
    last_refresh_token: Option<String>,
    last_exchange: Option<(String, String, String)>,
    revoked_tokens: Vec<String>,
}

/// Scriptable identity provider
///
/// # Examples
///
/// ```
/// use tokenward_common::testing::MockIdentityProvider;
/// use tokenward_common::auth::IdentityProvider;
///
/// let provider = MockIdentityProvider::new("mock");
/// assert_eq!(provider.provider_name(), "mock");
/// assert_eq!(provider.refresh_calls(), 0);
/// ```
#[derive(Clone)]
pub struct MockIdentityProvider {
    name: String,
    state: Arc<Mutex<MockState>>,
    exchange_calls: Arc<AtomicUsize>,
    refresh_calls: Arc<AtomicUsize>,
    profile_calls: Arc<AtomicUsize>,
    revoke_calls: Arc<AtomicUsize>,
}

impl MockIdentityProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
            exchange_calls: Arc::new(AtomicUsize::new(0)),
            refresh_calls: Arc::new(AtomicUsize::new(0)),
            profile_calls: Arc::new(AtomicUsize::new(0)),
            revoke_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Tokens returned by `exchange_code`
    pub fn set_exchange_response(&self, tokens: ProviderTokens) {
        self.state.lock().exchange_response = Some(tokens);
    }

    /// Tokens returned by `refresh_tokens`
    pub fn set_refresh_response(&self, tokens: ProviderTokens) {
        self.state.lock().refresh_response = Some(tokens);
    }

    /// Profile returned by `fetch_profile`
    pub fn set_profile(&self, profile: UserProfile) {
        self.state.lock().profile = Some(profile);
    }

    pub fn fail_exchange_with(&self, error: AuthError) {
        self.state.lock().exchange_failure = Some(error);
    }

    /// Every refresh fails with `error` until [`Self::clear_refresh_failure`]
    pub fn fail_refresh_with(&self, error: AuthError) {
        self.state.lock().refresh_failure = Some(error);
    }

    /// The next `times` refreshes fail with `error`, then scripted responses resume
    pub fn fail_refresh_times(&self, times: usize, error: AuthError) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.scripted_refresh_failures.push_back(error.clone());
        }
    }

    pub fn clear_refresh_failure(&self) {
        let mut state = self.state.lock();
        state.refresh_failure = None;
        state.scripted_refresh_failures.clear();
    }

    pub fn fail_profile_with(&self, error: AuthError) {
        self.state.lock().profile_failure = Some(error);
    }

    pub fn fail_revoke_with(&self, error: AuthError) {
        self.state.lock().revoke_failure = Some(error);
    }

    /// Delay applied before every refresh resolves
    pub fn set_refresh_delay(&self, delay: StdDuration) {
        self.state.lock().refresh_delay = Some(delay);
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    /// Refresh token presented on the most recent refresh
    pub fn last_refresh_token(&self) -> Option<String> {
        self.state.lock().last_refresh_token.clone()
    }

    /// Instants at which each refresh call started (tokio clock, so paused
    /// time is respected)
    pub fn refresh_instants(&self) -> Vec<tokio::time::Instant> {
        self.state.lock().refresh_instants.clone()
    }

    /// `(code, verifier, redirect_uri)` of the most recent exchange
    pub fn last_exchange(&self) -> Option<(String, String, String)> {
        self.state.lock().last_exchange.clone()
    }

    pub fn revoked_tokens(&self) -> Vec<String> {
        self.state.lock().revoked_tokens.clone()
    }

    /// Tokens with a one hour lifetime, used when nothing was scripted
    pub fn sample_tokens(access_token: &str, refresh_token: Option<&str>) -> ProviderTokens {
        Self::sample_tokens_expiring(access_token, refresh_token, Utc::now() + Duration::hours(1))
    }

    pub fn sample_tokens_expiring(
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> ProviderTokens {
        ProviderTokens {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
            id_token: None,
            token_type: "Bearer".to_string(),
            scope: ScopeSet::parse("openid email profile"),
            expires_at,
        }
    }

    pub fn sample_profile(id: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            email_verified: Some(true),
            name: Some("Test User".to_string()),
            picture: None,
        }
    }
}

impl std::fmt::Debug for MockIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockIdentityProvider")
            .field("name", &self.name)
            .field("refresh_calls", &self.refresh_calls())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn build_authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> AuthResult<String> {
        if redirect_uri.is_empty() {
            return Err(AuthError::invalid_request("redirect_uri is required"));
        }
        Ok(format!(
            "https://idp.mock/authorize?redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
            urlencoding::encode(redirect_uri),
            state,
            code_challenge
        ))
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> AuthResult<ProviderTokens> {
        let call = self.exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock();
        state.last_exchange =
            Some((code.to_string(), code_verifier.to_string(), redirect_uri.to_string()));
        if let Some(error) = state.exchange_failure.clone() {
            return Err(error);
        }
        Ok(state.exchange_response.clone().unwrap_or_else(|| {
            Self::sample_tokens(&format!("access-{call}"), Some(&format!("refresh-{call}")))
        }))
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> AuthResult<ProviderTokens> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = {
            let mut state = self.state.lock();
            state.last_refresh_token = Some(refresh_token.to_string());
            state.refresh_instants.push(tokio::time::Instant::now());
            state.refresh_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.scripted_refresh_failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.refresh_failure.clone() {
            return Err(error);
        }
        Ok(state
            .refresh_response
            .clone()
            .unwrap_or_else(|| Self::sample_tokens(&format!("refreshed-{call}"), None)))
    }

    async fn fetch_profile(&self, _access_token: &str) -> AuthResult<UserProfile> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if let Some(error) = state.profile_failure.clone() {
            return Err(error);
        }
        Ok(state.profile.clone().unwrap_or_else(|| Self::sample_profile("user-123")))
    }

    async fn revoke(&self, token: &str) -> AuthResult<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.revoked_tokens.push(token.to_string());
        match state.revoke_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Token repository that fails reads and deletes for chosen principals
pub struct FailingTokenRepository {
    inner: Arc<dyn TokenRepository>,
    failing: Mutex<HashSet<String>>,
    fail_bulk: AtomicBool,
}

impl FailingTokenRepository {
    pub fn new(inner: Arc<dyn TokenRepository>) -> Self {
        Self { inner, failing: Mutex::new(HashSet::new()), fail_bulk: AtomicBool::new(false) }
    }

    pub fn fail_for(&self, principal_id: &str) {
        self.failing.lock().insert(principal_id.to_string());
    }

    /// Make `delete_where` fail for every filter
    pub fn fail_bulk_deletes(&self) {
        self.fail_bulk.store(true, Ordering::SeqCst);
    }

    fn check(&self, principal_id: &str, operation: &str) -> CommonResult<()> {
        if self.failing.lock().contains(principal_id) {
            return Err(CommonError::persistence_op(
                operation,
                format!("injected failure for {principal_id}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenRepository for FailingTokenRepository {
    async fn upsert(&self, row: EncryptedTokenRow) -> CommonResult<()> {
        self.check(&row.principal_id, "upsert")?;
        self.inner.upsert(row).await
    }

    async fn get(&self, principal_id: &str, provider: &str) -> CommonResult<Option<EncryptedTokenRow>> {
        self.check(principal_id, "get")?;
        self.inner.get(principal_id, provider).await
    }

    async fn replace_if_unchanged(
        &self,
        row: EncryptedTokenRow,
        expected_ciphertext: &str,
    ) -> CommonResult<bool> {
        self.check(&row.principal_id, "replace_if_unchanged")?;
        self.inner.replace_if_unchanged(row, expected_ciphertext).await
    }

    async fn delete(&self, principal_id: &str, provider: &str) -> CommonResult<bool> {
        self.check(principal_id, "delete")?;
        self.inner.delete(principal_id, provider).await
    }

    async fn list(&self, filter: &TokenFilter) -> CommonResult<Vec<EncryptedTokenRow>> {
        self.inner.list(filter).await
    }

    async fn delete_where(&self, filter: &TokenFilter) -> CommonResult<usize> {
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(CommonError::persistence_op("delete_where", "injected bulk failure"));
        }
        self.inner.delete_where(filter).await
    }
}
