//! Prepared statement cache.
//!
//! Statements are prepared once against the pool and shared by every
//! caller. Lookups take a shared lock; a miss takes the exclusive lock and
//! checks again before preparing, so two callers racing on the same query
//! prepare it only once while hits never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::sqlite::{SqlitePool, SqliteStatement};
use sqlx::{Executor, Statement};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, StorageContext};

pub type CachedStatement = Arc<SqliteStatement<'static>>;

#[derive(Default)]
pub struct StatementCache {
    statements: RwLock<HashMap<&'static str, CachedStatement>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the prepared statement for `sql`, preparing it on first use.
    pub async fn get(&self, pool: &SqlitePool, sql: &'static str) -> Result<CachedStatement> {
        {
            let statements = self.statements.read().await;
            if let Some(statement) = statements.get(sql) {
                return Ok(Arc::clone(statement));
            }
        }

        let mut statements = self.statements.write().await;
        if let Some(statement) = statements.get(sql) {
            return Ok(Arc::clone(statement));
        }

        let statement = pool
            .prepare(sql)
            .await
            .context("failed to prepare statement")?;
        debug!("Prepared statement: {}", statement.sql().trim());

        let statement = Arc::new(statement);
        statements.insert(sql, Arc::clone(&statement));
        Ok(statement)
    }

    pub async fn len(&self) -> usize {
        self.statements.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.statements.read().await.is_empty()
    }

    /// Drops one statement; it is prepared again on next use.
    pub async fn evict(&self, sql: &str) -> bool {
        self.statements.write().await.remove(sql).is_some()
    }

    pub async fn clear(&self) {
        self.statements.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    const SELECT_ONE: &str = "SELECT 1";
    const SELECT_TWO: &str = "SELECT 2";

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_prepares_once() {
        let pool = memory_pool().await;
        let cache = StatementCache::new();
        assert!(cache.is_empty().await);

        let first = cache.get(&pool, SELECT_ONE).await.unwrap();
        let second = cache.get(&pool, SELECT_ONE).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len().await, 1);

        cache.get(&pool, SELECT_TWO).await.unwrap();
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_evict_and_clear() {
        let pool = memory_pool().await;
        let cache = StatementCache::new();

        let first = cache.get(&pool, SELECT_ONE).await.unwrap();
        assert!(cache.evict(SELECT_ONE).await);
        assert!(!cache.evict(SELECT_ONE).await);

        let again = cache.get(&pool, SELECT_ONE).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &again));

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_sql_is_not_cached() {
        let pool = memory_pool().await;
        let cache = StatementCache::new();

        let result = cache.get(&pool, "SELECT FROM nowhere WHERE").await;
        assert!(result.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_statement() {
        let pool = memory_pool().await;
        let cache = Arc::new(StatementCache::new());

        let mut handles = vec![];
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                cache.get(&pool, SELECT_ONE).await
            }));
        }

        let mut statements = vec![];
        for handle in handles {
            statements.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(cache.len().await, 1);
        assert!(statements.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }
}
