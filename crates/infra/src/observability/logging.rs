//! `tracing-subscriber` initialisation and flow logging helpers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokenward_common::auth::{AuthError, AuthFlowStage};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Subscriber configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty, with_target: true }
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over `config.level`. Returns `Ok(false)` when a subscriber
/// was already installed (tests, embedding applications).
///
/// # Errors
/// Returns an error if `config.level` is not a valid filter directive.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<bool> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let fmt_layer = match config.format {
        LogFormat::Json => fmt::layer().json().with_target(config.with_target).boxed(),
        LogFormat::Pretty => fmt::layer().with_target(config.with_target).boxed(),
    };

    Ok(tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init().is_ok())
}

/// Log the outcome of one authorization flow step.
///
/// `error` is logged through its kind label and message only.
#[inline]
pub fn log_flow_outcome(
    operation: &'static str,
    stage: AuthFlowStage,
    elapsed: Duration,
    error: Option<&AuthError>,
) {
    let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    match error {
        None => info!(operation, %stage, duration_ms, "auth_flow_success"),
        Some(e) => warn!(
            operation,
            %stage,
            duration_ms,
            error_kind = e.kind().as_str(),
            error = %e,
            "auth_flow_failure"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = LoggingConfig { level: "tokenward=verbose".to_string(), ..LoggingConfig::default() };
        if std::env::var("RUST_LOG").is_err() {
            assert!(init_tracing(&config).is_err());
        }
    }

    #[test]
    fn test_second_init_reports_existing_subscriber() {
        let config = LoggingConfig { format: LogFormat::Json, ..LoggingConfig::default() };
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config).unwrap());
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let config: LoggingConfig = serde_json::from_str(r#"{"format":"json"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");
    }
}
