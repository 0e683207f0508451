//! Typed service settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokenward_common::auth::{OAuthConfig, RuntimeEnvironment};
use tokenward_common::crypto::EncryptionKey;

use crate::observability::LoggingConfig;
use crate::scheduling::{CleanupSchedulerConfig, MaintenanceWindow, RefreshSchedulerConfig};

/// Configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(String),

    #[error("invalid setting {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid { field: field.to_string(), message: message.into() }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

const fn default_http_timeout_secs() -> u64 {
    30
}
const fn default_refresh_interval_secs() -> u64 {
    60
}
const fn default_refresh_buffer_secs() -> u64 {
    600
}
const fn default_refresh_skew_secs() -> u64 {
    300
}
const fn default_max_retries() -> u32 {
    3
}
const fn default_retry_base_delay_ms() -> u64 {
    1000
}
const fn default_refresh_batch_size() -> usize {
    5
}
const fn default_cleanup_interval_secs() -> u64 {
    3600
}
const fn default_grace_period_secs() -> u64 {
    7 * 24 * 3600
}
const fn default_audit_retention_days() -> u64 {
    90
}
const fn default_db_pool_size() -> u32 {
    4
}

/// Everything needed to assemble the authentication service
///
/// Only the provider registration, redirect URI and encryption key are
/// required; every timing knob has a default.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    pub provider: OAuthConfig,
    pub redirect_uri: String,
    /// Base64-encoded 32-byte AES key
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Require HTTPS redirect URIs
    #[serde(default)]
    pub secure_context: bool,

    /// SQLite file; in-memory storage when unset
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_db_pool_size")]
    pub database_pool_size: u32,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: u64,
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_refresh_batch_size")]
    pub refresh_batch_size: usize,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: u64,
    #[serde(default)]
    pub maintenance_window: Option<MaintenanceWindow>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AuthSettings {
    /// Settings with defaults for everything but the required fields
    pub fn new(provider: OAuthConfig, redirect_uri: impl Into<String>, encryption_key: &str) -> Self {
        Self {
            provider,
            redirect_uri: redirect_uri.into(),
            encryption_key: Some(encryption_key.to_string()),
            secure_context: false,
            database_path: None,
            database_pool_size: default_db_pool_size(),
            http_timeout_secs: default_http_timeout_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            refresh_buffer_secs: default_refresh_buffer_secs(),
            refresh_skew_secs: default_refresh_skew_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            refresh_batch_size: default_refresh_batch_size(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            audit_retention_days: default_audit_retention_days(),
            maintenance_window: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Check every setting the service depends on
    ///
    /// A missing or malformed encryption key is fatal; there is no fallback
    /// key.
    ///
    /// # Errors
    /// The first problem found.
    pub fn validate(&self) -> ConfigResult<()> {
        self.provider.validate().map_err(|e| ConfigError::invalid("provider", e.message()))?;
        self.encryption_key()?;

        let redirect = self.redirect_uri.trim();
        if redirect.is_empty() {
            return Err(ConfigError::Missing("redirect_uri".into()));
        }
        let scheme_ok = redirect.starts_with("https://")
            || (!self.secure_context && redirect.starts_with("http://"));
        if !scheme_ok {
            return Err(ConfigError::invalid(
                "redirect_uri",
                if self.secure_context { "must use https" } else { "must be an http(s) URL" },
            ));
        }

        let positive = [
            ("http_timeout_secs", self.http_timeout_secs),
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("refresh_buffer_secs", self.refresh_buffer_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("refresh_batch_size", self.refresh_batch_size as u64),
            ("database_pool_size", u64::from(self.database_pool_size)),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        if let Some(window) = self.maintenance_window {
            MaintenanceWindow::new(window.start_hour, window.end_hour)
                .map_err(|e| ConfigError::invalid("maintenance_window", e.to_string()))?;
        }
        Ok(())
    }

    /// Decoded encryption key
    ///
    /// # Errors
    /// `Missing` when unset, `Invalid` when not 32 bytes of base64.
    pub fn encryption_key(&self) -> ConfigResult<EncryptionKey> {
        let encoded = self
            .encryption_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing("encryption_key".into()))?;
        EncryptionKey::from_base64(encoded.trim())
            .map_err(|e| ConfigError::invalid("encryption_key", e.message()))
    }

    pub fn oauth_config(&self) -> &OAuthConfig {
        &self.provider
    }

    pub fn runtime_environment(&self) -> RuntimeEnvironment {
        RuntimeEnvironment { secure_context: self.secure_context }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.refresh_skew_secs))
    }

    pub fn refresh_scheduler_config(&self) -> RefreshSchedulerConfig {
        RefreshSchedulerConfig {
            interval: Duration::from_secs(self.refresh_interval_secs),
            refresh_buffer: chrono::Duration::seconds(secs_i64(self.refresh_buffer_secs)),
            batch_size: self.refresh_batch_size,
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn cleanup_scheduler_config(&self) -> CleanupSchedulerConfig {
        CleanupSchedulerConfig {
            interval: Duration::from_secs(self.cleanup_interval_secs),
            grace_period: chrono::Duration::seconds(secs_i64(self.grace_period_secs)),
            audit_retention: chrono::Duration::days(days_i64(self.audit_retention_days)),
            maintenance_window: self.maintenance_window,
            ..CleanupSchedulerConfig::default()
        }
    }
}

// chrono::Duration constructors panic beyond i64::MAX milliseconds
fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).map_or(i64::MAX / 1000, |s| s.min(i64::MAX / 1000))
}

fn days_i64(days: u64) -> i64 {
    i64::try_from(days).map_or(i64::MAX / 86_400_000, |d| d.min(i64::MAX / 86_400_000))
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("provider", &self.provider)
            .field("redirect_uri", &self.redirect_uri)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("secure_context", &self.secure_context)
            .field("database_path", &self.database_path)
            .field("refresh_interval_secs", &self.refresh_interval_secs)
            .field("cleanup_interval_secs", &self.cleanup_interval_secs)
            .finish_non_exhaustive()
    }
}
