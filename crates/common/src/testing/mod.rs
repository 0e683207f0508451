//! Testing utilities and helpers
//!
//! - **[`mocks`]**: scriptable identity provider and failure-injecting
//!   repositories for exercising the token lifecycle without a network.
//!
//! ## Usage
//!
//! ```rust
//! use tokenward_common::testing::MockIdentityProvider;
//!
//! let provider = MockIdentityProvider::new("mock");
//! provider.set_refresh_response(MockIdentityProvider::sample_tokens("at", Some("rt")));
//! ```

pub mod mocks;

pub use mocks::{FailingTokenRepository, MockIdentityProvider};
