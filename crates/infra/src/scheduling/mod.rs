//! Background sweeps over the stored tokens
//!
//! - Refresh scheduler: renews tokens before they expire, with retry/backoff
//!   and local revocation once the retry budget is spent
//! - Cleanup scheduler: removes expired tokens, states and audit events, and
//!   performs the emergency revoke-all
//!
//! Both follow the same runtime rules:
//! - Explicit lifecycle management (start/stop)
//! - Join handles for spawned tasks
//! - Cancellation token support, observed at tick boundaries and inside
//!   long-running sweeps
//! - Structured tracing on every sweep

pub mod cleanup_scheduler;
pub mod error;
pub mod refresh_scheduler;

pub use cleanup_scheduler::{
    CleanupScheduler, CleanupSchedulerConfig, CleanupStats, MaintenanceWindow,
};
pub use error::{SchedulerError, SchedulerResult};
pub use refresh_scheduler::{
    RefreshOutcome, RefreshScheduler, RefreshSchedulerConfig, RefreshSweepStats, RetryState,
};
