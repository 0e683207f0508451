//! Configuration loading and management
//!
//! [`AuthSettings`] describes the provider registration, key material and
//! scheduler timings. [`loader`] builds it from environment variables or a
//! config file.

pub mod loader;
pub mod settings;

// Re-export commonly used items
pub use loader::{load, load_from_env, load_from_file, load_from_vars, probe_config_paths};
pub use settings::{AuthSettings, ConfigError, ConfigResult};
