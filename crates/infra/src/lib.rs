//! # Tokenward Infrastructure
//!
//! Runtime assembly of the authentication stack defined in
//! `tokenward-common`.
//!
//! This crate contains:
//! - SQLite persistence for tokens, states and audit events (`rusqlite` + `r2d2`)
//! - Background refresh and cleanup schedulers
//! - Settings loading from environment and files
//! - `tracing-subscriber` setup
//! - [`AuthOrchestrator`], the application-facing service
//!
//! ## Architecture
//! - Implements the storage ports defined in `tokenward_common::storage`
//! - Contains all "impure" code (database files, timers, process environment)

pub mod config;
pub mod database;
pub mod observability;
pub mod scheduling;
pub mod service;

// Re-export commonly used items
pub use config::{AuthSettings, ConfigError};
pub use database::{DbManager, SqliteAuthStore};
pub use observability::{init_tracing, LoggingConfig};
pub use scheduling::{CleanupScheduler, RefreshScheduler, SchedulerError};
pub use service::{
    AuthFlowResult, AuthOrchestrator, AuthenticationFailed, AuthorizationRequest,
    CallbackOutcome, HealthReport, HealthStatus,
};
