//! SQLite connection setup

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Migration failed: {0}")]
    Migration(String),
}

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:cadence.db?mode=rwc")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode so readers never block the single writer
    pub wal_mode: bool,
    /// How long a connection waits on a locked database before failing
    pub busy_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:cadence.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Single-connection in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Open a pool and bring the schema up to date.
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, StorageError> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| StorageError::Connection(e.to_string()))?
        .busy_timeout(config.busy_timeout);

    if config.wal_mode {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

    info!(
        url = %config.url,
        wal = config.wal_mode,
        max_connections = config.max_connections,
        "Connected to SQLite"
    );

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    Ok(pool)
}
