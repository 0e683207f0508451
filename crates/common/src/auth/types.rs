//! OAuth 2.0 types shared across the auth stack
//!
//! Wire types (`TokenResponse`), provider output (`ProviderTokens`,
//! `UserProfile`), persisted records (`TokenRecord`, `AuthState`) and the
//! configuration handed to the provider client.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{AuthError, AuthResult};

/// Token lifetime assumed when a provider omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Lifetime of a pending authorization (state row), in seconds
pub const AUTH_STATE_TTL_SECS: i64 = 600;

// ============================================================================
// Scopes
// ============================================================================

/// Parsed, de-duplicated set of OAuth scopes
///
/// Capability checks go through explicit predicates instead of substring
/// matching on the raw scope string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    /// Parse a space-delimited scope string
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self(raw.split_whitespace().map(str::to_owned).collect())
    }

    /// True when the exact scope was granted
    #[must_use]
    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    /// OpenID Connect `openid` scope
    #[must_use]
    pub fn is_openid(&self) -> bool {
        self.contains("openid")
    }

    /// Basic profile claims (`profile`)
    #[must_use]
    pub fn allows_profile(&self) -> bool {
        self.contains("profile")
    }

    /// Email claims (`email`)
    #[must_use]
    pub fn allows_email(&self) -> bool {
        self.contains("email")
    }

    /// Refresh token issuance via the `offline_access` scope
    #[must_use]
    pub fn allows_offline_access(&self) -> bool {
        self.contains("offline_access")
    }

    /// Number of distinct scopes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no scope was granted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate scopes in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(" "))
    }
}

impl From<String> for ScopeSet {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<ScopeSet> for String {
    fn from(scopes: ScopeSet) -> Self {
        scopes.to_string()
    }
}

impl<S: Into<String>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// Provider output
// ============================================================================

/// OAuth token response from the token endpoint (RFC 6749 §5.1)
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Error body returned by the token endpoint (RFC 6749 §5.2)
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Tokens issued by the provider for one grant
///
/// `refresh_token` is optional: providers may not rotate it on refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub token_type: String,
    pub scope: ScopeSet,
    pub expires_at: DateTime<Utc>,
}

impl ProviderTokens {
    /// Build provider tokens, stamping `expires_at` relative to `issued_at`
    #[must_use]
    pub fn from_response(response: TokenResponse, issued_at: DateTime<Utc>) -> Self {
        let lifetime = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS).max(0);
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            id_token: response.id_token,
            token_type: response.token_type,
            scope: response.scope.as_deref().map(ScopeSet::parse).unwrap_or_default(),
            expires_at: issued_at + Duration::seconds(lifetime),
        }
    }
}

impl fmt::Debug for ProviderTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// User profile from the userinfo endpoint
///
/// Accepts both OIDC (`sub`) and legacy (`id`) identifier fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(alias = "sub")]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

// ============================================================================
// Persisted records
// ============================================================================

/// Decrypted token record for one principal
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub principal_id: String,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: ScopeSet,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    /// True once `now` has reached the expiry instant
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the token expires within `window` of `now`
    #[must_use]
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now + window >= self.expires_at
    }

    /// Seconds of remaining lifetime (negative once expired)
    #[must_use]
    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("principal_id", &self.principal_id)
            .field("provider", &self.provider)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

/// Secret half of a [`TokenRecord`], serialized then encrypted at rest
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct TokenSecrets {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
}

/// Encrypted row as held by a [`crate::storage::TokenRepository`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedTokenRow {
    pub principal_id: String,
    pub provider: String,
    /// Base64 blob produced by [`crate::crypto::TokenCipher::encrypt`]
    pub ciphertext: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pending authorization bound to one redirect round trip
///
/// Created at authorization start, consumed exactly once at callback.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthState {
    pub state: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthState {
    /// True once `now` is past the expiry instant
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("state", &self.state)
            .field("code_verifier", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Public half of a freshly created [`AuthState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub state: String,
    pub code_challenge: String,
    pub redirect_uri: String,
    pub expires_at: DateTime<Utc>,
}

/// Stage of the authorization round trip a failure occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlowStage {
    Idle,
    AuthorizationRequested,
    CallbackReceived,
    StateValidated,
    CodeExchanged,
    ProfileFetched,
    TokensPersisted,
}

impl fmt::Display for AuthFlowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::AuthorizationRequested => "authorization_requested",
            Self::CallbackReceived => "callback_received",
            Self::StateValidated => "state_validated",
            Self::CodeExchanged => "code_exchanged",
            Self::ProfileFetched => "profile_fetched",
            Self::TokensPersisted => "tokens_persisted",
        };
        f.write_str(label)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Capabilities of the host the flow runs in
///
/// When `secure_context` is set, redirect URIs must be HTTPS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEnvironment {
    pub secure_context: bool,
}

impl RuntimeEnvironment {
    /// Environment served over HTTPS
    #[must_use]
    pub const fn secure() -> Self {
        Self { secure_context: true }
    }
}

/// Identity provider registration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Provider label stored alongside every token row (e.g. "google")
    pub provider: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    /// Configuration for a provider that serves the conventional endpoint
    /// layout under one domain
    #[must_use]
    pub fn for_domain(provider: &str, domain: &str, client_id: &str) -> Self {
        Self {
            provider: provider.to_string(),
            client_id: client_id.to_string(),
            client_secret: None,
            authorization_endpoint: format!("https://{domain}/authorize"),
            token_endpoint: format!("https://{domain}/oauth/token"),
            userinfo_endpoint: format!("https://{domain}/userinfo"),
            revocation_endpoint: Some(format!("https://{domain}/oauth/revoke")),
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
        }
    }

    /// Scopes as a space-separated string
    #[must_use]
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// Check that the registration is usable
    ///
    /// # Errors
    /// Returns `Configuration` if the client id is empty or an endpoint is not
    /// an absolute URL.
    pub fn validate(&self) -> AuthResult<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::configuration("client_id must not be empty"));
        }
        if self.provider.trim().is_empty() {
            return Err(AuthError::configuration("provider must not be empty"));
        }

        let endpoints = [
            ("authorization_endpoint", Some(&self.authorization_endpoint)),
            ("token_endpoint", Some(&self.token_endpoint)),
            ("userinfo_endpoint", Some(&self.userinfo_endpoint)),
            ("revocation_endpoint", self.revocation_endpoint.as_ref()),
        ];
        for (name, value) in endpoints {
            if let Some(value) = value {
                url::Url::parse(value).map_err(|e| {
                    AuthError::configuration(format!("{name} is not a valid URL: {e}"))
                })?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("token_endpoint", &self.token_endpoint)
            .field("userinfo_endpoint", &self.userinfo_endpoint)
            .field("revocation_endpoint", &self.revocation_endpoint)
            .field("scopes", &self.scopes)
            .finish()
    }
}
