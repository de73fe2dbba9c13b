//! Redis-backed step store.
//!
//! # Data Structures
//!
//! - `tasks:{workflow_id}:{run_id}` (HASH): one field per step attempt
//!   (`{step_id}:{attempt}`) and one per suspension marker (`{id}`), each
//!   holding a JSON document.
//!
//! Fields are created with `HSETNX`, so a record is never overwritten by a
//! late or duplicate writer.

use super::{error::Result, error::StorageError, StepStore};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::debug;

/// Redis step store using an async connection pool.
pub struct RedisStepStore {
    pool: Pool,
}

impl RedisStepStore {
    /// Creates a new Redis step store with connection pooling.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use ponos::storage::RedisStepStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStepStore::new("redis://localhost:6379").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(redis_url: &str) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        // Fail early on a bad URL or an unreachable server.
        store.get_connection().await?;
        debug!(url = %redis_url, "connected to redis step store");
        Ok(store)
    }

    /// Builds a store around an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    /// Gets an async connection from the pool.
    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

#[async_trait]
impl StepStore for RedisStepStore {
    async fn load(&self, bucket: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.get_connection().await?;
        conn.hgetall(bucket)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn put_if_absent(&self, bucket: &str, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        conn.hset_nx(bucket, field, value)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn delete(&self, bucket: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: i64 = conn
            .del(bucket)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }
}
