//! Database connection manager backed by an r2d2 SQLite pool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tokenward_common::error::{CommonError, CommonResult};
use tracing::{info, warn};

pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS token_records (
    principal_id  TEXT    NOT NULL,
    provider      TEXT    NOT NULL,
    ciphertext    TEXT    NOT NULL,
    expires_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    PRIMARY KEY (principal_id, provider)
);
CREATE INDEX IF NOT EXISTS idx_token_records_expires_at ON token_records (expires_at);

CREATE TABLE IF NOT EXISTS auth_states (
    state          TEXT    PRIMARY KEY,
    code_verifier  TEXT    NOT NULL,
    redirect_uri   TEXT    NOT NULL,
    created_at     INTEGER NOT NULL,
    expires_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_auth_states_expires_at ON auth_states (expires_at);

CREATE TABLE IF NOT EXISTS audit_events (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT    NOT NULL UNIQUE,
    principal_id  TEXT,
    event_type    TEXT    NOT NULL,
    provider      TEXT    NOT NULL,
    metadata      TEXT    NOT NULL,
    timestamp     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_events_principal ON audit_events (principal_id, seq);
CREATE INDEX IF NOT EXISTS idx_audit_events_timestamp ON audit_events (timestamp);
";

const CONNECTION_PRAGMAS: &str =
    "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA synchronous = NORMAL;";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

pub type SqlitePool = Pool<SqliteConnectionManager>;
pub type SqliteConnection = PooledConnection<SqliteConnectionManager>;

/// Owns the connection pool for one database file.
pub struct DbManager {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl DbManager {
    /// Open (or create) a database file with the given pool size.
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32) -> CommonResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let manager = SqliteConnectionManager::file(&path)
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(manager)
            .map_err(|e| CommonError::persistence_op("open_pool", e.to_string()))?;

        info!(db_path = %path.display(), max_connections = pool.max_size(), "sqlite pool initialised");
        Ok(Self { pool, path: Some(path) })
    }

    /// Private in-memory database. Limited to one connection, since every
    /// new SQLite memory connection is a separate database.
    pub fn in_memory() -> CommonResult<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(SqliteConnectionManager::memory())
            .map_err(|e| CommonError::persistence_op("open_pool", e.to_string()))?;
        Ok(Self { pool, path: None })
    }

    /// Acquire a pooled connection.
    ///
    /// r2d2 only fails a checkout once its connection timeout elapses.
    pub fn get_connection(&self) -> CommonResult<SqliteConnection> {
        self.pool.get().map_err(|e| {
            warn!(error = %e, "sqlite pool exhausted");
            CommonError::timeout("acquire_connection", self.pool.connection_timeout())
        })
    }

    /// Ensure the full schema exists on the current database.
    pub fn run_migrations(&self) -> CommonResult<()> {
        let conn = self.get_connection()?;
        conn.execute_batch(SCHEMA_SQL).map_err(|e| map_sql_error("migrate", &e))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, CAST(strftime('%s','now') AS INTEGER))",
            params![SCHEMA_VERSION],
        )
        .map_err(|e| map_sql_error("migrate", &e))?;
        Ok(())
    }

    /// Database file path, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Verify the database answers a trivial query.
    pub fn health_check(&self) -> CommonResult<()> {
        let conn = self.get_connection()?;
        conn.query_row("SELECT 1", params![], |row| row.get::<_, i32>(0))
            .map_err(|e| map_sql_error("health_check", &e))?;
        Ok(())
    }
}

impl std::fmt::Debug for DbManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbManager").field("path", &self.path).finish_non_exhaustive()
    }
}

pub(crate) fn map_sql_error(operation: &str, err: &rusqlite::Error) -> CommonError {
    CommonError::persistence_op(operation, err.to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use tokenward_common::error::ErrorClassification;

    use super::*;

    #[test]
    fn migrations_create_schema_version() {
        let temp_dir = TempDir::new().expect("temp dir created");
        let db_path = temp_dir.path().join("tokens.db");

        let manager = DbManager::new(&db_path, 4).expect("manager created");
        manager.run_migrations().expect("migrations run");
        manager.run_migrations().expect("migrations are idempotent");

        let conn = manager.get_connection().expect("connection acquired");
        let version: i32 =
            conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert_eq!(manager.path(), Some(db_path.as_path()));
    }

    #[test]
    fn exhausted_pool_reports_timeout() {
        let manager = DbManager::in_memory().expect("manager created");
        let _held = manager.get_connection().expect("connection acquired");

        let err = manager.get_connection().expect_err("pool has a single connection");
        assert_eq!(
            err,
            CommonError::Timeout {
                operation: "acquire_connection".to_string(),
                duration: CONNECTION_TIMEOUT,
            }
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn health_check_succeeds_in_memory() {
        let manager = DbManager::in_memory().expect("manager created");
        manager.run_migrations().expect("migrations run");
        manager.health_check().expect("health check passed");
        assert!(manager.path().is_none());
    }
}
