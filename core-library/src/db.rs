//! # Database Connection Pool Module
//!
//! SQLite connection pooling for the sync engine's durable state.
//!
//! ## Features
//!
//! - **WAL Mode**: Concurrent readers alongside the single writer
//! - **Busy Timeout**: Writers from different workers wait instead of failing
//! - **Foreign Keys**: Libraries cascade to items and grants
//! - **Automatic Migrations**: Embedded from `./migrations` and run on creation
//! - **Health Checks**: Connection validated before the pool is returned
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_library::db::{create_pool, DatabaseConfig};
//!
//! let pool = create_pool(DatabaseConfig::new("/var/lib/media-sync/engine.db")).await?;
//! ```
//!
//! ## Testing
//!
//! ```rust,ignore
//! let pool = create_test_pool().await?;
//! ```

use crate::{LibraryError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub max_lifetime: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub statement_cache_capacity: usize,
}

impl DatabaseConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        let path = database_path.into();
        let database_url = format!("sqlite:{}", path.display());

        Self {
            database_url,
            min_connections: 1,
            max_connections: 8,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(10),
            max_lifetime: Some(Duration::from_secs(1800)),
            idle_timeout: Some(Duration::from_secs(600)),
            statement_cache_capacity: 100,
        }
    }

    /// A private in-memory database.
    ///
    /// Limited to one connection: connections to a shared in-memory database
    /// take table locks rather than waiting on the busy timeout.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            min_connections: 1,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(10),
            max_lifetime: None,
            idle_timeout: None,
            statement_cache_capacity: 100,
        }
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:")
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Open the pool, run migrations and verify the connection.
///
/// # Errors
///
/// Returns [`LibraryError::Database`] when the database cannot be opened and
/// [`LibraryError::Migration`] when the embedded migrations fail.
pub async fn create_pool(config: DatabaseConfig) -> Result<Pool<Sqlite>> {
    info!(
        database_url = %config.database_url,
        max_connections = config.max_connections,
        "Creating database connection pool"
    );

    let mut connect_options =
        SqliteConnectOptions::from_str(&config.database_url).map_err(LibraryError::Database)?;

    connect_options = connect_options
        .foreign_keys(true)
        .create_if_missing(true)
        .busy_timeout(config.busy_timeout)
        .statement_cache_capacity(config.statement_cache_capacity);

    if !config.is_in_memory() {
        connect_options = connect_options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("cache_size", "-32000");
    }

    let pool = SqlitePoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .connect_with(connect_options)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to create connection pool");
            LibraryError::Database(e)
        })?;

    run_migrations(&pool).await?;
    health_check(&pool).await?;

    info!(connections = pool.size(), "Database connection pool ready");
    Ok(pool)
}

/// In-memory pool with the schema applied.
pub async fn create_test_pool() -> Result<Pool<Sqlite>> {
    create_pool(DatabaseConfig::in_memory()).await
}

async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    debug!("Running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| {
            warn!(error = %e, "Migration failed");
            LibraryError::Migration(e.to_string())
        })?;

    Ok(())
}

/// Round-trip a trivial query.
pub async fn health_check(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
        warn!(error = %e, "Database health check failed");
        LibraryError::Database(e)
    })?;

    Ok(())
}
