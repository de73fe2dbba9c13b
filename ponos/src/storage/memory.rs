use super::{error::Result, StepStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;

/// In-memory step store using DashMap for concurrent access.
///
/// Buckets are keyed by name; each bucket is itself a DashMap so concurrent
/// steps of one run write to different shards. Suitable for tests and single
/// process development only: nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryStepStore {
    buckets: DashMap<String, DashMap<String, String>>,
}

impl InMemoryStepStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buckets currently held.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl StepStore for InMemoryStepStore {
    async fn load(&self, bucket: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .buckets
            .get(bucket)
            .map(|fields| {
                fields
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put_if_absent(&self, bucket: &str, field: &str, value: &str) -> Result<bool> {
        let fields = self.buckets.entry(bucket.to_string()).or_default();
        let created = match fields.entry(field.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                true
            }
        };
        Ok(created)
    }

    async fn delete(&self, bucket: &str) -> Result<()> {
        self.buckets.remove(bucket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_if_absent_is_write_once() {
        let store = InMemoryStepStore::new();

        assert!(store.put_if_absent("b", "a:1", "first").await.unwrap());
        assert!(!store.put_if_absent("b", "a:1", "second").await.unwrap());

        let fields = store.load("b").await.unwrap();
        assert_eq!(fields.get("a:1").map(String::as_str), Some("first"));
    }

    #[tokio::test]
    async fn test_missing_bucket_loads_empty() {
        let store = InMemoryStepStore::new();
        assert!(store.load("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_bucket() {
        let store = InMemoryStepStore::new();
        store.put_if_absent("b", "x", "1").await.unwrap();
        store.delete("b").await.unwrap();
        assert!(store.load("b").await.unwrap().is_empty());
        assert_eq!(store.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_writers_single_winner() {
        let store = Arc::new(InMemoryStepStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .put_if_absent("b", "step:1", &i.to_string())
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
