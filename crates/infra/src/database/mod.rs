//! SQLite persistence for tokens, authorization states and audit events

pub mod manager;
pub mod sqlite_store;

pub use manager::{DbManager, SqliteConnection, SqlitePool, SCHEMA_VERSION};
pub use sqlite_store::SqliteAuthStore;
