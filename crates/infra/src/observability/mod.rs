//! Logging setup and structured log helpers
//!
//! Token material never reaches a log line: helpers take stable labels and
//! identifiers only.

pub mod logging;

pub use logging::{init_tracing, log_flow_outcome, LogFormat, LoggingConfig};
