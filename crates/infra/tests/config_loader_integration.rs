//! Integration tests for configuration loader
//!
//! Tests the end-to-end behavior of loading settings from files and from a
//! variable lookup.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokenward_infra::config::{self, ConfigError};
use tokenward_infra::scheduling::MaintenanceWindow;

// 32 zero bytes
const TEST_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

fn write_with_extension(contents: &str, extension: &str) -> PathBuf {
    let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
    temp_file.write_all(contents.as_bytes()).expect("Failed to write to temp file");
    let path = temp_file.path().with_extension(extension);
    std::fs::copy(temp_file.path(), &path).expect("Failed to copy file");
    path
}

#[test]
fn test_load_settings_from_toml_file() {
    let toml_content = format!(
        r#"
redirect_uri = "https://app.example.com/callback"
encryption_key = "{TEST_KEY}"
secure_context = true
database_path = "/var/lib/tokenward/tokens.db"
refresh_interval_secs = 30
max_retries = 5
retry_base_delay_ms = 250

[provider]
provider = "example"
client_id = "client-1"
client_secret = "s3cret"
authorization_endpoint = "https://id.example.com/authorize"
token_endpoint = "https://id.example.com/oauth/token"
userinfo_endpoint = "https://id.example.com/userinfo"
revocation_endpoint = "https://id.example.com/oauth/revoke"
scopes = ["openid", "profile", "email", "offline_access"]

[maintenance_window]
start_hour = 23
end_hour = 4

[logging]
level = "tokenward=debug"
format = "json"
"#
    );
    let path = write_with_extension(&toml_content, "toml");

    let settings = config::load_from_file(Some(path.clone())).expect("TOML settings should load");
    settings.validate().expect("settings should validate");

    assert_eq!(settings.provider.client_secret.as_deref(), Some("s3cret"));
    assert!(settings.secure_context);
    assert_eq!(settings.database_path, Some(PathBuf::from("/var/lib/tokenward/tokens.db")));

    let refresh = settings.refresh_scheduler_config();
    assert_eq!(refresh.interval, Duration::from_secs(30));
    assert_eq!(refresh.max_retries, 5);
    assert_eq!(refresh.base_delay, Duration::from_millis(250));
    assert_eq!(refresh.batch_size, 5);

    let cleanup = settings.cleanup_scheduler_config();
    assert_eq!(cleanup.maintenance_window, Some(MaintenanceWindow::new(23, 4).unwrap()));
    assert_eq!(settings.logging.level, "tokenward=debug");

    std::fs::remove_file(path).ok();
}

#[test]
fn test_load_settings_from_json_file_with_defaults() {
    let json_content = format!(
        r#"{{
        "redirect_uri": "http://localhost:8080/callback",
        "encryption_key": "{TEST_KEY}",
        "provider": {{
            "provider": "example",
            "client_id": "client-1",
            "authorization_endpoint": "https://id.example.com/authorize",
            "token_endpoint": "https://id.example.com/oauth/token",
            "userinfo_endpoint": "https://id.example.com/userinfo"
        }}
    }}"#
    );
    let path = write_with_extension(&json_content, "json");

    let settings = config::load_from_file(Some(path.clone())).expect("JSON settings should load");
    settings.validate().expect("settings should validate");

    assert!(settings.database_path.is_none());
    assert!(settings.provider.revocation_endpoint.is_none());
    assert_eq!(settings.http_timeout(), Duration::from_secs(30));
    assert_eq!(settings.refresh_skew(), chrono::Duration::minutes(5));
    assert_eq!(settings.cleanup_scheduler_config().grace_period, chrono::Duration::days(7));

    std::fs::remove_file(path).ok();
}

#[test]
fn test_settings_without_key_fail_validation() {
    let json_content = r#"{
        "redirect_uri": "https://app.example.com/callback",
        "provider": {
            "provider": "example",
            "client_id": "client-1",
            "authorization_endpoint": "https://id.example.com/authorize",
            "token_endpoint": "https://id.example.com/oauth/token",
            "userinfo_endpoint": "https://id.example.com/userinfo"
        }
    }"#;
    let path = write_with_extension(json_content, "json");

    let settings = config::load_from_file(Some(path.clone())).expect("file should parse");
    assert!(matches!(settings.validate(), Err(ConfigError::Missing(_))));

    std::fs::remove_file(path).ok();
}

#[test]
fn test_load_from_vars_matches_file_shape() {
    let vars: HashMap<&str, &str> = [
        ("TOKENWARD_PROVIDER", "example"),
        ("TOKENWARD_CLIENT_ID", "client-1"),
        ("TOKENWARD_DOMAIN", "id.example.com"),
        ("TOKENWARD_REDIRECT_URI", "https://app.example.com/callback"),
        ("TOKENWARD_ENCRYPTION_KEY", TEST_KEY),
        ("TOKENWARD_CLEANUP_INTERVAL_SECS", "900"),
    ]
    .into_iter()
    .collect();

    let settings = config::load_from_vars(|key| vars.get(key).map(|v| (*v).to_string()))
        .expect("settings should load from vars");
    settings.validate().expect("settings should validate");

    assert_eq!(settings.provider.userinfo_endpoint, "https://id.example.com/userinfo");
    assert_eq!(settings.cleanup_scheduler_config().interval, Duration::from_secs(900));
}

#[test]
fn test_load_from_nonexistent_file() {
    let result = config::load_from_file(Some("/nonexistent/path/tokenward.toml".into()));
    assert!(matches!(result, Err(ConfigError::Io { .. })));
}

#[test]
fn test_load_with_invalid_format() {
    let path = write_with_extension(r#"{ "redirect_uri": "#, "json");

    let result = config::load_from_file(Some(path.clone()));
    match result {
        Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("Expected parse error, got {other:?}"),
    }

    std::fs::remove_file(path).ok();
}
