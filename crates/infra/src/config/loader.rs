//! Configuration loader
//!
//! Loads [`AuthSettings`] from environment variables or files.
//!
//! ## Loading Strategy
//! 1. Reads a `.env` file if one exists (via `dotenvy`)
//! 2. Attempts to load from `TOKENWARD_*` environment variables
//! 3. If incomplete, falls back to loading from file
//! 4. Supports JSON and TOML formats
//!
//! ## Environment Variables
//! Required:
//! - `TOKENWARD_PROVIDER`: provider label stored with every token row
//! - `TOKENWARD_CLIENT_ID`
//! - `TOKENWARD_REDIRECT_URI`
//! - `TOKENWARD_ENCRYPTION_KEY`: base64, 32 bytes
//! - either `TOKENWARD_DOMAIN` (conventional endpoint layout) or all of
//!   `TOKENWARD_AUTHORIZATION_ENDPOINT`, `TOKENWARD_TOKEN_ENDPOINT` and
//!   `TOKENWARD_USERINFO_ENDPOINT`
//!
//! Optional: `TOKENWARD_CLIENT_SECRET`, `TOKENWARD_REVOCATION_ENDPOINT`,
//! `TOKENWARD_SCOPES` (space separated), `TOKENWARD_SECURE_CONTEXT`,
//! `TOKENWARD_DB_PATH`, `TOKENWARD_DB_POOL_SIZE`, `TOKENWARD_HTTP_TIMEOUT_SECS`,
//! `TOKENWARD_REFRESH_INTERVAL_SECS`, `TOKENWARD_REFRESH_BUFFER_SECS`,
//! `TOKENWARD_REFRESH_SKEW_SECS`, `TOKENWARD_MAX_RETRIES`,
//! `TOKENWARD_RETRY_BASE_DELAY_MS`, `TOKENWARD_REFRESH_BATCH_SIZE`,
//! `TOKENWARD_CLEANUP_INTERVAL_SECS`, `TOKENWARD_GRACE_PERIOD_SECS`,
//! `TOKENWARD_AUDIT_RETENTION_DAYS`, `TOKENWARD_LOG_LEVEL`.
//!
//! ## File Locations
//! The loader probes `tokenward.toml` and `tokenward.json` in the current
//! directory, its parent, and next to the executable.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokenward_common::auth::OAuthConfig;

use super::settings::{AuthSettings, ConfigError, ConfigResult};

const ENV_PREFIX: &str = "TOKENWARD_";

/// Load settings with automatic fallback strategy
///
/// # Errors
/// Returns the file error when neither source yields settings, or a
/// validation error for settings that loaded but are unusable.
pub fn load() -> ConfigResult<AuthSettings> {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "Loaded .env file");
    }

    let settings = match load_from_env() {
        Ok(settings) => {
            tracing::info!("Configuration loaded from environment variables");
            settings
        }
        Err(e) => {
            tracing::debug!(error = %e, "Environment incomplete, trying config file");
            load_from_file(None)?
        }
    };

    settings.validate()?;
    Ok(settings)
}

/// Load settings from `TOKENWARD_*` environment variables
///
/// # Errors
/// `Missing` for an absent required variable, `Invalid` for an unparsable
/// value.
pub fn load_from_env() -> ConfigResult<AuthSettings> {
    load_from_vars(|key| std::env::var(key).ok())
}

/// Load settings through an arbitrary variable lookup
///
/// `lookup` receives full variable names (`TOKENWARD_CLIENT_ID`).
///
/// # Errors
/// See [`load_from_env`].
pub fn load_from_vars<F>(lookup: F) -> ConfigResult<AuthSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let vars = Vars { lookup };

    let provider_name = vars.required("PROVIDER")?;
    let client_id = vars.required("CLIENT_ID")?;
    let mut provider = match vars.optional("DOMAIN") {
        Some(domain) => OAuthConfig::for_domain(&provider_name, &domain, &client_id),
        None => OAuthConfig {
            provider: provider_name,
            client_id,
            client_secret: None,
            authorization_endpoint: vars.required("AUTHORIZATION_ENDPOINT")?,
            token_endpoint: vars.required("TOKEN_ENDPOINT")?,
            userinfo_endpoint: vars.required("USERINFO_ENDPOINT")?,
            revocation_endpoint: None,
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
        },
    };
    provider.client_secret = vars.optional("CLIENT_SECRET");
    if let Some(endpoint) = vars.optional("REVOCATION_ENDPOINT") {
        provider.revocation_endpoint = Some(endpoint);
    }
    if let Some(scopes) = vars.optional("SCOPES") {
        provider.scopes = scopes.split_whitespace().map(str::to_string).collect();
    }

    let redirect_uri = vars.required("REDIRECT_URI")?;
    let encryption_key = vars.required("ENCRYPTION_KEY")?;
    let mut settings = AuthSettings::new(provider, redirect_uri, &encryption_key);

    settings.secure_context = vars.flag("SECURE_CONTEXT", false);
    settings.database_path = vars.optional("DB_PATH").map(PathBuf::from);
    vars.parse_into("DB_POOL_SIZE", &mut settings.database_pool_size)?;
    vars.parse_into("HTTP_TIMEOUT_SECS", &mut settings.http_timeout_secs)?;
    vars.parse_into("REFRESH_INTERVAL_SECS", &mut settings.refresh_interval_secs)?;
    vars.parse_into("REFRESH_BUFFER_SECS", &mut settings.refresh_buffer_secs)?;
    vars.parse_into("REFRESH_SKEW_SECS", &mut settings.refresh_skew_secs)?;
    vars.parse_into("MAX_RETRIES", &mut settings.max_retries)?;
    vars.parse_into("RETRY_BASE_DELAY_MS", &mut settings.retry_base_delay_ms)?;
    vars.parse_into("REFRESH_BATCH_SIZE", &mut settings.refresh_batch_size)?;
    vars.parse_into("CLEANUP_INTERVAL_SECS", &mut settings.cleanup_interval_secs)?;
    vars.parse_into("GRACE_PERIOD_SECS", &mut settings.grace_period_secs)?;
    vars.parse_into("AUDIT_RETENTION_DAYS", &mut settings.audit_retention_days)?;
    if let Some(level) = vars.optional("LOG_LEVEL") {
        settings.logging.level = level;
    }

    Ok(settings)
}

/// Load settings from a file
///
/// If `path` is `None`, probes the standard locations.
///
/// # Errors
/// `Missing` when no file is found, `Io` when it cannot be read, `Parse`
/// for malformed content.
pub fn load_from_file(path: Option<PathBuf>) -> ConfigResult<AuthSettings> {
    let config_path = match path {
        Some(p) => p,
        None => probe_config_paths()
            .ok_or_else(|| ConfigError::Missing("tokenward.toml or tokenward.json".into()))?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|source| ConfigError::Io { path: config_path.clone(), source })?;

    parse_settings(&contents, &config_path)
}

/// Parse settings, choosing the format by file extension
fn parse_settings(contents: &str, path: &Path) -> ConfigResult<AuthSettings> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let parse_error = |message: String| ConfigError::Parse { path: path.to_path_buf(), message };

    match extension {
        "toml" => toml::from_str(contents).map_err(|e| parse_error(e.to_string())),
        "json" => serde_json::from_str(contents).map_err(|e| parse_error(e.to_string())),
        other => Err(parse_error(format!("unsupported config format: {other}"))),
    }
}

/// First existing `tokenward.{toml,json}` in the standard locations
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd.clone());
        dirs.push(cwd.join(".."));
    }
    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        dirs.push(exe_dir);
    }

    dirs.iter()
        .flat_map(|dir| [dir.join("tokenward.toml"), dir.join("tokenward.json")])
        .find(|path| path.exists())
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, suffix: &str) -> ConfigResult<String> {
        self.optional(suffix).ok_or_else(|| ConfigError::Missing(format!("{ENV_PREFIX}{suffix}")))
    }

    fn parse_into<T>(&self, suffix: &str, target: &mut T) -> ConfigResult<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.optional(suffix) {
            *target = raw.trim().parse().map_err(|e: T::Err| {
                ConfigError::invalid(&format!("{ENV_PREFIX}{suffix}"), e.to_string())
            })?;
        }
        Ok(())
    }

    /// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`
    fn flag(&self, suffix: &str, default: bool) -> bool {
        self.optional(suffix)
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(default)
    }
}
