//! Storage layer for ponos step records.
//!
//! This module provides a trait-based interface for the durable memo table
//! with multiple backend implementations:
//!
//! - [`InMemoryStepStore`]: Fast in-memory storage for testing and development
//! - [`RedisStepStore`]: Redis hashes, one per run (feature `redis`)
//!
//! On top of a store, [`StepCache`] is the per-invocation snapshot used by the
//! replay engine.
//!
//! # Example
//!
//! ```
//! use ponos::storage::{InMemoryStepStore, StepStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStepStore::new();
//! assert!(store.put_if_absent("tasks:wf:run-1", "a:1", "{}").await?);
//! assert!(!store.put_if_absent("tasks:wf:run-1", "a:1", "{}").await?);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

mod error;
pub mod memory;
mod step_cache;

#[cfg(feature = "redis")]
pub mod redis;

pub use error::{Result, StorageError};
pub use memory::InMemoryStepStore;
pub use step_cache::{
    bucket_key, marker_key, parse_snapshot, parse_step_key, step_key, StepCache, StepOutcome,
    SuspensionRecord,
};

#[cfg(feature = "redis")]
pub use redis::RedisStepStore;

/// Trait for step record storage backends.
///
/// A bucket is a flat string-to-string map; every run owns one bucket. Fields
/// are written once: `put_if_absent` never overwrites an existing field.
/// Implementations must be thread-safe.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Reads every field of a bucket. A missing bucket is empty.
    async fn load(&self, bucket: &str) -> Result<HashMap<String, String>>;

    /// Writes `field` unless it already exists.
    ///
    /// Returns `true` if this call created the field.
    async fn put_if_absent(&self, bucket: &str, field: &str, value: &str) -> Result<bool>;

    /// Removes a bucket and all of its fields.
    async fn delete(&self, bucket: &str) -> Result<()>;
}

// Allows sharing one store between workflows as `Arc<dyn StepStore>`.
#[async_trait]
impl<S: StepStore + ?Sized> StepStore for Arc<S> {
    async fn load(&self, bucket: &str) -> Result<HashMap<String, String>> {
        (**self).load(bucket).await
    }

    async fn put_if_absent(&self, bucket: &str, field: &str, value: &str) -> Result<bool> {
        (**self).put_if_absent(bucket, field, value).await
    }

    async fn delete(&self, bucket: &str) -> Result<()> {
        (**self).delete(bucket).await
    }
}
