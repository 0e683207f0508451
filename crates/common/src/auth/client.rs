//! OAuth 2.0 client for one identity provider
//!
//! Handles the HTTP side of the Authorization Code + PKCE flow:
//! - Browser authorization URL building
//! - Authorization code exchange
//! - Token refresh
//! - Userinfo lookup
//! - Token revocation (RFC 7009)
//!
//! Every request goes through one `reqwest::Client` with a bounded timeout.
//! Failures are mapped onto [`AuthErrorKind`]; a request that never gets a
//! response is a `NetworkError`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::error::{AuthError, AuthErrorKind, AuthResult};
use super::pkce::CHALLENGE_METHOD;
use super::traits::IdentityProvider;
use super::types::{
    OAuthConfig, OAuthErrorResponse, ProviderTokens, RuntimeEnvironment, TokenResponse,
    UserProfile,
};

/// Default timeout applied to every provider request
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static EMAIL_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());

fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.as_ref().is_some_and(|pattern| pattern.is_match(email))
}

/// OAuth 2.0 client with PKCE support
#[derive(Debug, Clone)]
pub struct OAuthClient {
    config: OAuthConfig,
    environment: RuntimeEnvironment,
    http: Client,
}

impl OAuthClient {
    /// Create a client with the default 30 s timeout
    ///
    /// # Errors
    /// Returns `Configuration` if the registration is invalid or the HTTP
    /// client cannot be built.
    ///
    /// # Examples
    /// ```
    /// use tokenward_common::auth::{OAuthClient, OAuthConfig, RuntimeEnvironment};
    ///
    /// let config = OAuthConfig::for_domain("auth0", "dev-test.us.auth0.com", "client_id");
    /// let client = OAuthClient::new(config, RuntimeEnvironment::secure())?;
    /// # Ok::<(), tokenward_common::auth::AuthError>(())
    /// ```
    pub fn new(config: OAuthConfig, environment: RuntimeEnvironment) -> AuthResult<Self> {
        Self::with_timeout(config, environment, DEFAULT_HTTP_TIMEOUT)
    }

    /// Create a client with an explicit request timeout
    ///
    /// # Errors
    /// Same as [`OAuthClient::new`].
    pub fn with_timeout(
        config: OAuthConfig,
        environment: RuntimeEnvironment,
        timeout: Duration,
    ) -> AuthResult<Self> {
        config.validate()?;
        let http = Client::builder().timeout(timeout).build().map_err(|e| {
            AuthError::configuration(format!("failed to build HTTP client: {e}"))
        })?;
        Ok(Self { config, environment, http })
    }

    /// Get a reference to the OAuth configuration
    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    fn validate_redirect_uri(&self, redirect_uri: &str) -> AuthResult<()> {
        if redirect_uri.trim().is_empty() {
            return Err(AuthError::invalid_request("redirect_uri must not be empty"));
        }
        let parsed = url::Url::parse(redirect_uri)
            .map_err(|e| AuthError::invalid_request(format!("redirect_uri is malformed: {e}")))?;
        if self.environment.secure_context && parsed.scheme() != "https" {
            return Err(AuthError::invalid_request(
                "redirect_uri must use https in a secure context",
            ));
        }
        Ok(())
    }

    fn client_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("client_id".to_string(), self.config.client_id.clone())];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret".to_string(), secret.clone()));
        }
        params
    }

    async fn token_request(&self, params: Vec<(String, String)>) -> AuthResult<ProviderTokens> {
        let issued_at = Utc::now();
        let response = self
            .http
            .post(&self.config.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| transport_error("token", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(token_error(status, &body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::server(format!("unparseable token response: {e}")))?;

        if token_response.access_token.is_empty() {
            return Err(AuthError::server("token response carried an empty access_token"));
        }

        Ok(ProviderTokens::from_response(token_response, issued_at))
    }
}

fn transport_error(endpoint: &str, err: &reqwest::Error) -> AuthError {
    let reason = if err.is_timeout() { "timed out" } else { "request failed" };
    AuthError::network(format!("{endpoint} endpoint {reason}: {err}")).with_context(endpoint)
}

fn token_error(status: StatusCode, body: &str) -> AuthError {
    match serde_json::from_str::<OAuthErrorResponse>(body) {
        Ok(oauth) => {
            let kind = AuthErrorKind::from_oauth_code(&oauth.error);
            let message = oauth.error_description.unwrap_or_else(|| oauth.error.clone());
            AuthError::new(kind, message).with_context(format!("HTTP {status}"))
        }
        Err(_) => AuthError::server(format!("token endpoint returned HTTP {status}")),
    }
}

fn profile_error(status: StatusCode) -> AuthError {
    match status {
        StatusCode::UNAUTHORIZED => {
            AuthError::new(AuthErrorKind::InvalidToken, "userinfo rejected the access token")
        }
        StatusCode::FORBIDDEN => AuthError::new(
            AuthErrorKind::InsufficientScope,
            "access token lacks the scope userinfo requires",
        ),
        other => AuthError::server(format!("userinfo endpoint returned HTTP {other}")),
    }
}

#[async_trait]
impl IdentityProvider for OAuthClient {
    fn provider_name(&self) -> &str {
        &self.config.provider
    }

    fn build_authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> AuthResult<String> {
        self.validate_redirect_uri(redirect_uri)?;

        let params = [
            ("response_type", "code".to_string()),
            ("client_id", self.config.client_id.clone()),
            ("redirect_uri", redirect_uri.to_string()),
            ("scope", self.config.scope_string()),
            ("state", state.to_string()),
            ("code_challenge", code_challenge.to_string()),
            ("code_challenge_method", CHALLENGE_METHOD.to_string()),
            ("access_type", "offline".to_string()),
            ("prompt", "consent".to_string()),
        ];

        let query_string = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let separator = if self.config.authorization_endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{separator}{query_string}", self.config.authorization_endpoint))
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> AuthResult<ProviderTokens> {
        if code.is_empty() {
            return Err(AuthError::invalid_request("authorization code is empty"));
        }

        let mut params = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("code_verifier".to_string(), code_verifier.to_string()),
        ];
        params.extend(self.client_params());

        debug!(provider = %self.config.provider, "Exchanging authorization code");
        self.token_request(params).await
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> AuthResult<ProviderTokens> {
        if refresh_token.is_empty() {
            return Err(AuthError::invalid_grant("no refresh token available"));
        }

        let mut params = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        params.extend(self.client_params());

        debug!(provider = %self.config.provider, "Refreshing access token");
        self.token_request(params).await
    }

    async fn fetch_profile(&self, access_token: &str) -> AuthResult<UserProfile> {
        let response = self
            .http
            .get(&self.config.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error("userinfo", &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(profile_error(status));
        }

        let profile: UserProfile = response
            .json()
            .await
            .map_err(|e| AuthError::server(format!("unparseable userinfo response: {e}")))?;

        if profile.id.trim().is_empty() {
            return Err(AuthError::server("userinfo response has no subject id"));
        }
        if !is_valid_email(&profile.email) {
            return Err(AuthError::server("userinfo response has no valid email"));
        }

        Ok(profile)
    }

    async fn revoke(&self, token: &str) -> AuthResult<()> {
        let Some(endpoint) = &self.config.revocation_endpoint else {
            debug!(provider = %self.config.provider, "No revocation endpoint configured");
            return Ok(());
        };

        let mut params = vec![("token".to_string(), token.to_string())];
        params.extend(self.client_params());

        let response = self
            .http
            .post(endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| transport_error("revocation", &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        warn!(provider = %self.config.provider, %status, "Provider rejected token revocation");
        let body = response.text().await.unwrap_or_default();
        let err = token_error(status, &body);
        Err(if status.is_server_error() {
            AuthError::server(err.message().to_string())
        } else {
            err
        })
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for auth::client.
    use super::*;

    fn client(environment: RuntimeEnvironment) -> OAuthClient {
        let config = OAuthConfig::for_domain("test", "auth.example.com", "client-123");
        OAuthClient::new(config, environment).unwrap()
    }

    /// Validates `OAuthClient::build_authorization_url` behavior for the
    /// required parameters scenario.
    ///
    /// Assertions:
    /// - Ensures every PKCE and offline-access parameter is present.
    /// - Ensures the redirect URI is percent-encoded.
    #[test]
    fn test_authorization_url_contains_required_params() {
        let url = client(RuntimeEnvironment::default())
            .build_authorization_url("http://localhost:8080/cb", "state-1", "challenge-1")
            .unwrap();

        assert!(url.starts_with("https://auth.example.com/authorize?"));
        for expected in [
            "response_type=code",
            "client_id=client-123",
            "redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fcb",
            "scope=openid%20profile%20email",
            "state=state-1",
            "code_challenge=challenge-1",
            "code_challenge_method=S256",
            "access_type=offline",
            "prompt=consent",
        ] {
            assert!(url.contains(expected), "missing {expected} in {url}");
        }
    }

    #[test]
    fn test_secure_context_requires_https_redirect() {
        let secure = client(RuntimeEnvironment::secure());
        let err = secure
            .build_authorization_url("http://localhost:8080/cb", "s", "c")
            .unwrap_err();
        assert_eq!(err.kind(), AuthErrorKind::InvalidRequest);

        assert!(secure.build_authorization_url("https://app.example.com/cb", "s", "c").is_ok());
    }

    #[test]
    fn test_rejects_empty_or_malformed_redirect() {
        let client = client(RuntimeEnvironment::default());
        for bad in ["", "   ", "not a url"] {
            let err = client.build_authorization_url(bad, "s", "c").unwrap_err();
            assert_eq!(err.kind(), AuthErrorKind::InvalidRequest, "input {bad:?}");
        }
    }

    #[test]
    fn test_token_error_mapping() {
        let err = token_error(StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#);
        assert_eq!(err.kind(), AuthErrorKind::InvalidGrant);

        let err = token_error(
            StatusCode::UNAUTHORIZED,
            r#"{"error":"invalid_client","error_description":"bad secret"}"#,
        );
        assert_eq!(err.kind(), AuthErrorKind::UnauthorizedClient);
        assert_eq!(err.message(), "bad secret");

        let err = token_error(StatusCode::BAD_GATEWAY, "<html>upstream</html>");
        assert_eq!(err.kind(), AuthErrorKind::ServerError);
    }

    #[test]
    fn test_profile_error_mapping() {
        assert_eq!(profile_error(StatusCode::UNAUTHORIZED).kind(), AuthErrorKind::InvalidToken);
        assert_eq!(profile_error(StatusCode::FORBIDDEN).kind(), AuthErrorKind::InsufficientScope);
        assert_eq!(
            profile_error(StatusCode::SERVICE_UNAVAILABLE).kind(),
            AuthErrorKind::ServerError
        );
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("user@example.com"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("no-at-sign.example.com"));
    }
}
