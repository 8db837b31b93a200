//! Connection pool and shared statement cache.
//!
//! One [`Database`] is created per process and cloned into every
//! repository. Clones share the pool and the prepared statement cache.

use std::path::Path;
use std::sync::Arc;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result, StorageContext};
use crate::schema;
use crate::statement_cache::{CachedStatement, StatementCache};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    statements: Arc<StatementCache>,
}

impl Database {
    /// Opens (creating if needed) the configured database file and brings
    /// its schema up to date.
    pub async fn connect(config: &Config) -> Result<Self> {
        let path = config.database_file();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = Self::connect_options(&path, config);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .max_lifetime(config.max_lifetime())
            .connect_with(options)
            .await
            .context("failed to open database")?;

        info!(
            "Opened database {} (max {} connections)",
            path.display(),
            config.max_connections
        );

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool and applies pending migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        schema::migrate(&pool).await?;
        Ok(Self {
            pool,
            statements: Arc::new(StatementCache::new()),
        })
    }

    fn connect_options(path: &Path, config: &Config) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// Returns the cached prepared statement for `sql`.
    pub async fn statement(&self, sql: &'static str) -> Result<CachedStatement> {
        self.statements.get(&self.pool, sql).await
    }

    /// Fails unless foreign key enforcement is active on `conn`.
    ///
    /// Deletes that rely on `ON DELETE CASCADE` call this first; without
    /// enforcement they would leave orphaned ranges and leases behind.
    pub async fn require_foreign_keys(conn: &mut sqlx::SqliteConnection) -> Result<()> {
        let enabled: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&mut *conn)
            .await
            .context("failed to read foreign_keys pragma")?;

        if enabled == 0 {
            return Err(Error::Validation(
                "foreign key enforcement is disabled; cascading delete unavailable".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
