//! Identity provider abstraction
//!
//! The token store, lifecycle manager and orchestrator depend on this trait
//! rather than on the HTTP client, so tests can inject
//! `testing::MockIdentityProvider`.

use async_trait::async_trait;

use super::error::AuthResult;
use super::types::{ProviderTokens, UserProfile};

/// Operations exposed by the external identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Provider label stored with every token row
    fn provider_name(&self) -> &str;

    /// Build the browser authorization URL
    ///
    /// # Errors
    /// Returns `InvalidRequest` if `redirect_uri` is empty, unparseable, or
    /// not HTTPS while running in a secure context.
    fn build_authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> AuthResult<String>;

    /// Exchange an authorization code for tokens
    ///
    /// # Errors
    /// Provider `error` codes map onto the auth taxonomy; transport failures
    /// become `NetworkError`.
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> AuthResult<ProviderTokens>;

    /// Redeem a refresh token
    ///
    /// The result's `refresh_token` is `None` when the provider did not rotate
    /// it.
    ///
    /// # Errors
    /// `InvalidGrant` when the refresh token is dead.
    async fn refresh_tokens(&self, refresh_token: &str) -> AuthResult<ProviderTokens>;

    /// Fetch the user profile for an access token
    ///
    /// # Errors
    /// `InvalidToken` on 401, `InsufficientScope` on 403, `ServerError` on 5xx
    /// or a profile without id or with a malformed email.
    async fn fetch_profile(&self, access_token: &str) -> AuthResult<UserProfile>;

    /// Revoke a token at the provider
    ///
    /// # Errors
    /// Any non-2xx response is surfaced.
    async fn revoke(&self, token: &str) -> AuthResult<()>;
}
