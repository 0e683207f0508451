//! Integration tests for `AuthOrchestrator`
//!
//! Drives complete sign-in flows through the service surface, once against a
//! wiremock identity provider over SQLite and otherwise against the scripted
//! mock provider over in-memory storage.

#![cfg(feature = "test-utils")]

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use tokenward_common::auth::{
    derive_code_challenge, AuthError, AuthErrorKind, AuthFlowStage, OAuthConfig,
};
use tokenward_common::crypto::EncryptionKey;
use tokenward_common::storage::MemoryAuthStore;
use tokenward_common::testing::MockIdentityProvider;
use tokenward_infra::{AuthOrchestrator, AuthSettings, HealthStatus};
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REDIRECT: &str = "https://app.example.com/callback";

fn settings(key: &EncryptionKey) -> AuthSettings {
    AuthSettings::new(OAuthConfig::for_domain("mock", "idp.mock", "client-1"), REDIRECT, &key.to_base64())
}

fn mock_service() -> (Arc<MemoryAuthStore>, Arc<MockIdentityProvider>, AuthOrchestrator) {
    let key = EncryptionKey::generate();
    let repo = Arc::new(MemoryAuthStore::new());
    let provider = Arc::new(MockIdentityProvider::new("mock"));
    let service = AuthOrchestrator::new(provider.clone(), repo.clone(), &key, &settings(&key))
        .expect("service should assemble");
    (repo, provider, service)
}

fn query_param(url: &str, name: &str) -> String {
    Url::parse(url)
        .expect("authorization URL should parse")
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| panic!("missing query parameter {name}"))
}

async fn sign_in(service: &AuthOrchestrator, code: &str) -> String {
    let request = service.initiate_auth(REDIRECT).await.unwrap();
    let outcome = service.handle_callback(code, &request.state, REDIRECT).await.unwrap();
    outcome.profile.id
}

/// Validates a full sign-in against a real HTTP provider.
///
/// # Test Steps
/// 1. Build the service from settings with a SQLite file and wiremock endpoints
/// 2. Start sign-in and read the state and PKCE challenge from the URL
/// 3. Complete the callback and check the verifier sent to the token endpoint
/// 4. Read the stored tokens back through `get_valid_tokens`
#[tokio::test(flavor = "multi_thread")]
async fn test_full_login_with_http_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "openid profile email"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": "user-42",
            "email": "user42@example.com",
            "name": "User Forty-Two"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let key = EncryptionKey::generate();
    let base = server.uri();
    let mut settings = settings(&key);
    settings.provider = OAuthConfig {
        provider: "wiremock".into(),
        client_id: "client-1".into(),
        client_secret: None,
        authorization_endpoint: format!("{base}/authorize"),
        token_endpoint: format!("{base}/oauth/token"),
        userinfo_endpoint: format!("{base}/userinfo"),
        revocation_endpoint: None,
        scopes: vec!["openid".into(), "profile".into(), "email".into()],
    };
    settings.database_path = Some(temp_dir.path().join("tokens.db"));

    let service = AuthOrchestrator::from_settings(&settings).expect("service should build");
    let request = service.initiate_auth(REDIRECT).await.unwrap();
    assert_eq!(query_param(&request.auth_url, "state"), request.state);
    let challenge = query_param(&request.auth_url, "code_challenge");

    let outcome = service.handle_callback("code-1", &request.state, REDIRECT).await.unwrap();
    assert_eq!(outcome.profile.id, "user-42");
    assert_eq!(outcome.tokens.access_token, "at-1");

    let token_request = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path() == "/oauth/token")
        .expect("token endpoint should be called");
    let verifier = url::form_urlencoded::parse(&token_request.body)
        .find(|(k, _)| k == "code_verifier")
        .map(|(_, v)| v.into_owned())
        .expect("verifier should be sent");
    assert_eq!(derive_code_challenge(&verifier).unwrap(), challenge);

    let record = service.get_valid_tokens("user-42").await.unwrap().unwrap();
    assert_eq!(record.refresh_token.as_deref(), Some("rt-1"));
    assert_eq!(record.provider, "wiremock");
}

/// Validates rejection of forged and replayed callbacks.
///
/// # Test Steps
/// 1. Start sign-in and call back with a modified state
/// 2. Verify `InvalidState` at `CallbackReceived`, no exchange and no tokens
/// 3. Complete the flow, then replay the same callback and verify rejection
#[tokio::test]
async fn test_tampered_state_is_rejected() {
    let (repo, provider, service) = mock_service();
    let request = service.initiate_auth(REDIRECT).await.unwrap();

    let forged = format!("{}x", request.state);
    let err = service.handle_callback("code-1", &forged, REDIRECT).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidState);
    assert_eq!(err.stage, AuthFlowStage::CallbackReceived);
    assert_eq!(
        err.to_string(),
        "The sign-in attempt expired or was tampered with. Please try again."
    );
    assert_eq!(provider.exchange_calls(), 0);
    assert_eq!(repo.token_count(), 0);

    service.handle_callback("code-1", &request.state, REDIRECT).await.unwrap();
    let replay = service.handle_callback("code-1", &request.state, REDIRECT).await.unwrap_err();
    assert_eq!(replay.kind, AuthErrorKind::InvalidState);
    assert_eq!(provider.exchange_calls(), 1);
}

#[tokio::test]
async fn test_redirect_mismatch_is_rejected() {
    let (repo, provider, service) = mock_service();
    let request = service.initiate_auth(REDIRECT).await.unwrap();

    let err = service
        .handle_callback("code-1", &request.state, "https://evil.example.com/callback")
        .await
        .unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::InvalidState);
    assert_eq!(provider.exchange_calls(), 0);
    assert_eq!(repo.token_count(), 0);
}

/// Validates the dead refresh token scenario.
///
/// # Test Steps
/// 1. Sign in, then age the stored token into the refresh window
/// 2. Make the provider answer `invalid_grant`
/// 3. Verify `get_valid_tokens` reports no session and the row is gone
#[tokio::test]
async fn test_dead_refresh_token_signs_user_out() {
    let (repo, provider, service) = mock_service();
    let principal = sign_in(&service, "code-1").await;

    service
        .manager()
        .store_tokens(
            &principal,
            &MockIdentityProvider::sample_tokens_expiring("stale", Some("rt-dead"), Utc::now()),
        )
        .await
        .unwrap();
    provider.fail_refresh_with(AuthError::invalid_grant("refresh token revoked"));

    assert!(service.get_valid_tokens(&principal).await.unwrap().is_none());
    assert_eq!(provider.last_refresh_token().as_deref(), Some("rt-dead"));
    assert_eq!(repo.token_count(), 0);
}

#[tokio::test]
async fn test_transient_refresh_failure_surfaces_safe_message() {
    let (repo, provider, service) = mock_service();
    let principal = sign_in(&service, "code-1").await;
    provider.fail_refresh_with(AuthError::network("connection reset by peer"));

    let err = service.refresh_user(&principal).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::NetworkError);
    assert!(!err.to_string().contains("connection reset"));
    assert_eq!(repo.token_count(), 1);
}

#[tokio::test]
async fn test_revoke_user_and_revoke_all() {
    let (repo, provider, service) = mock_service();
    provider.set_profile(MockIdentityProvider::sample_profile("alice"));
    let alice = sign_in(&service, "code-a").await;
    provider.set_profile(MockIdentityProvider::sample_profile("bob"));
    sign_in(&service, "code-b").await;
    provider.set_profile(MockIdentityProvider::sample_profile("carol"));
    sign_in(&service, "code-c").await;

    assert!(service.revoke_user(&alice).await.unwrap());
    assert!(!service.revoke_user(&alice).await.unwrap());
    assert_eq!(service.revoke_all("tenant offboarding").await.unwrap(), 2);
    assert_eq!(repo.token_count(), 0);
    assert_eq!(provider.revoke_calls(), 3);
}

/// Validates health reporting across the background lifecycle.
///
/// # Test Steps
/// 1. Check health before starting: degraded
/// 2. Start background work twice: healthy
/// 3. Shut down twice: degraded again, no error
#[tokio::test(flavor = "multi_thread")]
async fn test_health_follows_background_lifecycle() {
    let (_, _, service) = mock_service();

    let report = service.health_check().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(report.config_valid);
    assert_eq!(report.issues.len(), 2);

    service.start_background().await.unwrap();
    service.start_background().await.unwrap();
    let report = service.health_check().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.refresh_scheduler_running && report.cleanup_scheduler_running);
    assert!(report.issues.is_empty());

    service.shutdown().await.unwrap();
    service.shutdown().await.unwrap();
    assert_eq!(service.health_check().await.status, HealthStatus::Degraded);
}
