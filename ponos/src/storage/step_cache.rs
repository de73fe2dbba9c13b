//! Per-invocation snapshot of a run's step records.
//!
//! Every run owns the bucket `tasks:{workflow_id}:{run_id}`. It holds two
//! kinds of fields:
//!
//! - `{step_id}:{attempt}` → a JSON [`Outcome`] for one attempt of a step
//! - `{id}:marker` → a JSON [`SuspensionRecord`] written by `sleep` and
//!   `wait_for_event`
//!
//! The bucket is read once when an invocation starts. Writes go to the store
//! first and then into the snapshot, so a value the handler has seen is
//! always durable.

use super::{error::Result, error::StorageError, StepStore};
use crate::core::{deserialize_value, from_json, serialize_value, to_json, CoreError};
use crate::core::{Failure, Outcome};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// What one attempt of a step recorded.
pub type StepOutcome = Outcome<Failure, Value>;

/// Marker left by a suspension primitive once it no longer needs to suspend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SuspensionRecord {
    /// The sleep elapsed or the event arrived (with its payload, if any).
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// The wait ran out before an event arrived.
    Timedout,
}

/// Bucket name for a run's records.
pub fn bucket_key(workflow_id: &str, run_id: &str) -> String {
    format!("tasks:{}:{}", workflow_id, run_id)
}

/// Field name for one attempt of a step.
pub fn step_key(step_id: &str, attempt: u32) -> String {
    format!("{}:{}", step_id, attempt)
}

/// Field name for the suspension marker of `id`.
///
/// The suffix never parses as an attempt, so markers and step records cannot
/// share a field whatever the ids are.
pub fn marker_key(id: &str) -> String {
    format!("{}:marker", id)
}

/// Splits a `{step_id}:{attempt}` field at its last `:`.
///
/// # Errors
/// Returns `CoreError::MalformedStepKey` when there is no `:` or the suffix is
/// not a positive attempt number.
pub fn parse_step_key(field: &str) -> crate::core::Result<(&str, u32)> {
    let malformed = || CoreError::MalformedStepKey(field.to_string());
    let (step_id, attempt) = field.rsplit_once(':').ok_or_else(malformed)?;
    match attempt.parse::<u32>() {
        Ok(n) if n >= 1 => Ok((step_id, n)),
        _ => Err(malformed()),
    }
}

/// Parses raw store fields into JSON values.
pub fn parse_snapshot(bucket: &str, fields: HashMap<String, String>) -> Result<HashMap<String, Value>> {
    fields
        .into_iter()
        .map(|(field, text)| {
            let value = deserialize_value::<Value>(&text).map_err(|e| StorageError::Corrupt {
                bucket: bucket.to_string(),
                field: field.clone(),
                reason: e.to_string(),
            })?;
            Ok((field, value))
        })
        .collect()
}

/// Snapshot of a run's bucket plus write-through access to the store.
pub struct StepCache {
    store: Arc<dyn StepStore>,
    bucket: String,
    snapshot: DashMap<String, Value>,
}

impl StepCache {
    /// Reads the run's bucket once.
    pub async fn load(store: Arc<dyn StepStore>, workflow_id: &str, run_id: &str) -> Result<Self> {
        let bucket = bucket_key(workflow_id, run_id);
        let fields = store.load(&bucket).await?;
        let snapshot: DashMap<String, Value> = parse_snapshot(&bucket, fields)?.into_iter().collect();
        debug!(bucket = %bucket, records = snapshot.len(), "loaded step cache");
        Ok(Self {
            store,
            bucket,
            snapshot,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Every record in the snapshot, keyed by field.
    pub fn cached_steps(&self) -> HashMap<String, Value> {
        self.snapshot
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// The recorded outcome of one attempt, if any.
    pub fn attempt(&self, step_id: &str, attempt: u32) -> Result<Option<StepOutcome>> {
        let key = step_key(step_id, attempt);
        match self.snapshot.get(&key) {
            Some(value) => Ok(Some(self.decode(&key, value.clone())?)),
            None => Ok(None),
        }
    }

    /// Every recorded attempt of a step, in attempt order.
    ///
    /// Only fields whose prefix is exactly `step_id` count, so `a` never sees
    /// the records of `ab` or `a:b`.
    pub fn attempts(&self, step_id: &str) -> Result<Vec<StepOutcome>> {
        let mut ordered = BTreeMap::new();
        for entry in self.snapshot.iter() {
            if let Ok((id, n)) = parse_step_key(entry.key()) {
                if id == step_id {
                    ordered.insert(n, (entry.key().clone(), entry.value().clone()));
                }
            }
        }
        ordered
            .into_values()
            .map(|(key, value)| self.decode(&key, value))
            .collect()
    }

    /// The outcome of the latest recorded attempt.
    pub fn result(&self, step_id: &str) -> Result<Option<StepOutcome>> {
        Ok(self.attempts(step_id)?.pop())
    }

    /// The suspension marker stored for `id`, if any.
    pub fn marker(&self, id: &str) -> Result<Option<SuspensionRecord>> {
        let key = marker_key(id);
        match self.snapshot.get(&key) {
            Some(value) => Ok(Some(self.decode(&key, value.clone())?)),
            None => Ok(None),
        }
    }

    /// Records one attempt of a step.
    ///
    /// Returns `false` when another writer recorded this attempt first; the
    /// existing record is kept.
    pub async fn record_attempt(&self, step_id: &str, attempt: u32, outcome: &StepOutcome) -> Result<bool> {
        self.write(&step_key(step_id, attempt), outcome).await
    }

    /// Records the suspension marker for `id`.
    pub async fn record_marker(&self, id: &str, record: &SuspensionRecord) -> Result<bool> {
        self.write(&marker_key(id), record).await
    }

    async fn write<T: Serialize>(&self, field: &str, record: &T) -> Result<bool> {
        let value = to_json(record)?;
        let text = serialize_value(&value)?;
        let created = self.store.put_if_absent(&self.bucket, field, &text).await?;
        if created {
            self.snapshot.insert(field.to_string(), value);
        } else {
            warn!(bucket = %self.bucket, field = %field, "record already exists, keeping the first write");
            self.refresh(field).await?;
        }
        Ok(created)
    }

    /// Replaces the snapshot's copy of `field` with what the store holds.
    async fn refresh(&self, field: &str) -> Result<()> {
        let mut fields = self.store.load(&self.bucket).await?;
        match fields.remove(field) {
            Some(text) => {
                let value = deserialize_value::<Value>(&text).map_err(|e| StorageError::Corrupt {
                    bucket: self.bucket.clone(),
                    field: field.to_string(),
                    reason: e.to_string(),
                })?;
                self.snapshot.insert(field.to_string(), value);
            }
            None => {
                self.snapshot.remove(field);
            }
        }
        Ok(())
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, field: &str, value: Value) -> Result<T> {
        from_json(value).map_err(|e| StorageError::Corrupt {
            bucket: self.bucket.clone(),
            field: field.to_string(),
            reason: e.to_string(),
        })
    }
}

impl std::fmt::Debug for StepCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCache")
            .field("bucket", &self.bucket)
            .field("records", &self.snapshot.len())
            .finish()
    }
}
