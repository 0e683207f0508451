//! Closed error taxonomy for the authorization flow and token lifecycle.
//!
//! Every failure inside the auth stack is an [`AuthError`] carrying one
//! [`AuthErrorKind`]. Provider `error` codes are mapped onto the taxonomy by
//! [`AuthErrorKind::from_oauth_code`]; transport failures become
//! `NetworkError`. Only `NetworkError` and `ServerError` are retryable.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CommonError, ErrorClassification, ErrorSeverity};

/// Result alias used throughout the auth stack
pub type AuthResult<T> = Result<T, AuthError>;

/// Failure categories recognised by the auth stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    /// Malformed request, unsupported grant type, bad redirect URI
    InvalidRequest,
    /// Client authentication failed or the client is not allowed this grant
    UnauthorizedClient,
    /// The user or provider denied the request
    AccessDenied,
    /// Requested scope is invalid or unknown
    InvalidScope,
    /// Authorization code or refresh token is invalid, expired or revoked
    InvalidGrant,
    /// Access token rejected by a resource endpoint (HTTP 401)
    InvalidToken,
    /// Access token lacks the scope a resource endpoint requires (HTTP 403)
    InsufficientScope,
    /// CSRF state missing, expired, reused or mismatched
    InvalidState,
    /// Provider returned a 5xx or an unusable payload
    ServerError,
    /// No response from the provider (connect failure, timeout)
    NetworkError,
    /// Ciphertext could not be authenticated or decoded
    DecryptionError,
    /// Background refresh gave up after the retry budget
    RefreshExhausted,
    /// Persistence adapter failure
    Storage,
    /// Invalid or missing configuration
    Configuration,
}

impl AuthErrorKind {
    /// Stable snake_case identifier used in logs and audit metadata
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::AccessDenied => "access_denied",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidToken => "invalid_token",
            Self::InsufficientScope => "insufficient_scope",
            Self::InvalidState => "invalid_state",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::DecryptionError => "decryption_error",
            Self::RefreshExhausted => "refresh_exhausted",
            Self::Storage => "storage_error",
            Self::Configuration => "configuration_error",
        }
    }

    /// Map an RFC 6749 `error` code from a token endpoint response
    ///
    /// Unknown codes fall into `ServerError`.
    #[must_use]
    pub fn from_oauth_code(code: &str) -> Self {
        match code {
            "invalid_grant" => Self::InvalidGrant,
            "invalid_client" | "unauthorized_client" => Self::UnauthorizedClient,
            "invalid_request" | "unsupported_grant_type" | "unsupported_response_type" => {
                Self::InvalidRequest
            }
            "invalid_scope" => Self::InvalidScope,
            "access_denied" => Self::AccessDenied,
            _ => Self::ServerError,
        }
    }

    /// Message that is safe to show to an end user
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::InvalidGrant | Self::InvalidToken | Self::RefreshExhausted => {
                "Your session has expired. Please sign in again."
            }
            Self::InvalidState => "The sign-in attempt expired or was tampered with. Please try again.",
            Self::AccessDenied => "Access was denied. Please grant the requested permissions.",
            Self::InvalidScope | Self::InsufficientScope => {
                "The requested permissions are not available for this account."
            }
            Self::ServerError | Self::NetworkError => {
                "The sign-in service is temporarily unavailable. Please try again later."
            }
            Self::InvalidRequest
            | Self::UnauthorizedClient
            | Self::DecryptionError
            | Self::Storage
            | Self::Configuration => "Sign-in failed because of a configuration problem.",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An auth-stack failure
///
/// `Clone` so that one refresh outcome can be handed to every caller that
/// joined the same in-flight refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct AuthError {
    kind: AuthErrorKind,
    message: String,
    context: Option<String>,
}

impl AuthError {
    /// Create an error of the given kind
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), context: None }
    }

    /// Attach free-form context (operation name, principal, endpoint)
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Shorthand for [`AuthErrorKind::InvalidRequest`]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InvalidRequest, message)
    }

    /// Shorthand for [`AuthErrorKind::InvalidState`]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InvalidState, message)
    }

    /// Shorthand for [`AuthErrorKind::InvalidGrant`]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InvalidGrant, message)
    }

    /// Shorthand for [`AuthErrorKind::ServerError`]
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::ServerError, message)
    }

    /// Shorthand for [`AuthErrorKind::NetworkError`]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::NetworkError, message)
    }

    /// Shorthand for [`AuthErrorKind::DecryptionError`]
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::DecryptionError, message)
    }

    /// Shorthand for [`AuthErrorKind::Storage`]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Storage, message)
    }

    /// Shorthand for [`AuthErrorKind::Configuration`]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Configuration, message)
    }

    /// Failure category
    #[must_use]
    pub const fn kind(&self) -> AuthErrorKind {
        self.kind
    }

    /// Internal diagnostic message (not for end users)
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Optional context attached with [`AuthError::with_context`]
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Message that is safe to show to an end user
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }

    /// True when the failure means the stored grant is dead
    #[must_use]
    pub const fn is_invalid_grant(&self) -> bool {
        matches!(self.kind, AuthErrorKind::InvalidGrant)
    }
}

impl ErrorClassification for AuthError {
    fn is_retryable(&self) -> bool {
        matches!(self.kind, AuthErrorKind::NetworkError | AuthErrorKind::ServerError)
    }

    fn severity(&self) -> ErrorSeverity {
        match self.kind {
            AuthErrorKind::NetworkError | AuthErrorKind::ServerError => ErrorSeverity::Warning,
            AuthErrorKind::DecryptionError | AuthErrorKind::Configuration => {
                ErrorSeverity::Critical
            }
            AuthErrorKind::AccessDenied => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self.kind, AuthErrorKind::DecryptionError | AuthErrorKind::Configuration)
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl From<CommonError> for AuthError {
    fn from(err: CommonError) -> Self {
        let kind = match &err {
            CommonError::Config { .. } => AuthErrorKind::Configuration,
            _ => AuthErrorKind::Storage,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage(format!("token payload serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for auth::error.
    use super::*;

    /// Validates `AuthErrorKind::from_oauth_code` behavior for the provider
    /// error code mapping scenario.
    ///
    /// Assertions:
    /// - Confirms each RFC 6749 code lands in its taxonomy bucket.
    /// - Confirms unknown codes fall back to `ServerError`.
    #[test]
    fn test_oauth_code_mapping() {
        assert_eq!(AuthErrorKind::from_oauth_code("invalid_grant"), AuthErrorKind::InvalidGrant);
        assert_eq!(
            AuthErrorKind::from_oauth_code("invalid_client"),
            AuthErrorKind::UnauthorizedClient
        );
        assert_eq!(
            AuthErrorKind::from_oauth_code("unauthorized_client"),
            AuthErrorKind::UnauthorizedClient
        );
        assert_eq!(
            AuthErrorKind::from_oauth_code("unsupported_grant_type"),
            AuthErrorKind::InvalidRequest
        );
        assert_eq!(AuthErrorKind::from_oauth_code("invalid_request"), AuthErrorKind::InvalidRequest);
        assert_eq!(AuthErrorKind::from_oauth_code("invalid_scope"), AuthErrorKind::InvalidScope);
        assert_eq!(AuthErrorKind::from_oauth_code("access_denied"), AuthErrorKind::AccessDenied);
        assert_eq!(AuthErrorKind::from_oauth_code("temporarily_unavailable"), AuthErrorKind::ServerError);
    }

    #[test]
    fn test_only_transport_and_server_errors_are_retryable() {
        let retryable = [AuthErrorKind::NetworkError, AuthErrorKind::ServerError];
        let all = [
            AuthErrorKind::InvalidRequest,
            AuthErrorKind::UnauthorizedClient,
            AuthErrorKind::AccessDenied,
            AuthErrorKind::InvalidScope,
            AuthErrorKind::InvalidGrant,
            AuthErrorKind::InvalidToken,
            AuthErrorKind::InsufficientScope,
            AuthErrorKind::InvalidState,
            AuthErrorKind::ServerError,
            AuthErrorKind::NetworkError,
            AuthErrorKind::DecryptionError,
            AuthErrorKind::RefreshExhausted,
            AuthErrorKind::Storage,
            AuthErrorKind::Configuration,
        ];

        for kind in all {
            let err = AuthError::new(kind, "x");
            assert_eq!(err.is_retryable(), retryable.contains(&kind), "kind {kind}");
        }
    }

    #[test]
    fn test_display_and_context() {
        let err = AuthError::invalid_state("state expired").with_context("handle_callback");
        assert_eq!(err.to_string(), "invalid_state: state expired");
        assert_eq!(err.context(), Some("handle_callback"));
        assert!(err.user_message().contains("try again"));
    }

    /// Validates `AuthError::from` behavior for the storage error folding
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms persistence errors become `Storage`.
    /// - Confirms config errors become `Configuration`.
    #[test]
    fn test_common_error_conversion() {
        let storage: AuthError = CommonError::persistence("locked").into();
        assert_eq!(storage.kind(), AuthErrorKind::Storage);

        let config: AuthError = CommonError::config("missing key").into();
        assert_eq!(config.kind(), AuthErrorKind::Configuration);
        assert!(config.is_critical());
    }
}
