//! OAuth 2.0 Authorization Code + PKCE for a single identity provider
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────┐
//! │ TokenLifecycleManager  │  get_valid / refresh / revoke, de-duplicated
//! └───────────┬────────────┘
//!             │
//!             ▼
//! ┌────────────────────────┐      ┌──────────────────────┐
//! │      TokenStore        │ ───► │ dyn IdentityProvider │  OAuthClient (HTTP)
//! └───────────┬────────────┘      └──────────────────────┘
//!             │
//!             ├──► TokenCipher        (AES-256-GCM at rest)
//!             ├──► dyn TokenRepository
//!             └──► AuditTrail
//!
//! CsrfStateStore ──► dyn StateRepository   (state + PKCE verifier, single use)
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokenward_common::auth::{
//!     AuditTrail, CsrfStateStore, IdentityProvider, OAuthClient, OAuthConfig,
//!     RuntimeEnvironment, TokenLifecycleManager, TokenStore,
//! };
//! use tokenward_common::crypto::{EncryptionKey, TokenCipher};
//! use tokenward_common::storage::MemoryAuthStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OAuthConfig::for_domain("auth0", "tenant.eu.auth0.com", "client-id");
//! let client = Arc::new(OAuthClient::new(config, RuntimeEnvironment::secure())?);
//! let repo = Arc::new(MemoryAuthStore::new());
//!
//! let states = CsrfStateStore::new(repo.clone());
//! let pending = states.create_state("https://app.example.com/callback").await?;
//! let url = client.build_authorization_url(
//!     &pending.redirect_uri,
//!     &pending.state,
//!     &pending.code_challenge,
//! )?;
//! println!("Open {url}");
//!
//! let store = Arc::new(TokenStore::new(
//!     repo.clone(),
//!     TokenCipher::new(&EncryptionKey::generate()),
//!     client.clone(),
//!     AuditTrail::new(repo, "auth0"),
//! ));
//! let tokens = TokenLifecycleManager::new(store);
//! let _record = tokens.get_valid("user-123").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security Features
//!
//! - **PKCE (S256)**: verifier never leaves the process until the exchange
//! - **Single-use state**: consumed atomically, constant-time comparison
//! - **Encryption at rest**: token secrets are only persisted as AEAD blobs
//! - **Redacted Debug**: no token, verifier or secret reaches the logs

pub mod audit;
pub mod client;
pub mod error;
pub mod lifecycle;
pub mod pkce;
pub mod state_store;
pub mod token_store;
pub mod traits;
pub mod types;

pub use audit::{AuditEvent, AuditEventType, AuditTrail};
pub use client::OAuthClient;
pub use error::{AuthError, AuthErrorKind, AuthResult};
pub use lifecycle::{TokenLifecycleManager, DEFAULT_REFRESH_SKEW_SECS};
pub use pkce::{derive_code_challenge, generate_code_verifier, generate_state, PkceChallenge};
pub use state_store::CsrfStateStore;
pub use token_store::TokenStore;
pub use traits::IdentityProvider;
pub use types::{
    AuthFlowStage, AuthState, EncryptedTokenRow, OAuthConfig, PendingAuthorization,
    ProviderTokens, RuntimeEnvironment, ScopeSet, TokenRecord, TokenResponse, UserProfile,
};
