//! Token custody primitives for an OAuth 2.0 + PKCE client.
//!
//! # Feature Tiers
//!
//! - `foundation`: error taxonomy and classification
//! - `runtime`: async, crypto and locking dependencies
//! - `platform`: auth flows, encryption at rest, persistence ports (default)
//! - `observability`: tracing (pulled in by `runtime`)
//! - `test-utils`: mock identity provider and failure-injecting repositories

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;

// Platform tier
// -------------------------------------------------------------------
#[cfg(feature = "platform")]
pub mod auth;
#[cfg(feature = "platform")]
pub mod crypto;
#[cfg(feature = "platform")]
pub mod storage;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "test-utils", test))]
pub mod testing;

#[cfg(feature = "platform")]
pub use auth::{AuthError, AuthErrorKind, AuthResult};
#[cfg(feature = "foundation")]
pub use error::{CommonError, CommonResult, ErrorClassification, ErrorSeverity};
