//! Durable wait-for-event through the companion events queue.
//!
//! Each outstanding wait is one PendingWait job with id `{run_id}:{event}`
//! in `{workflow_id}-events`. It is a child of the run's job and starts
//! delayed by the wait's timeout:
//!
//! - `emit_event` attaches `{ "data": .. }` and moves the delay to zero
//! - the companion worker completes the job with `{"status":"success","data":..}`
//!   if a payload is attached, `{"status":"timedout"}` otherwise
//! - finishing the child releases the parent run, whose handler replays,
//!   reads the child's result and records it as a suspension marker

use super::context::{Step, WaitForEventOptions};
use super::error::{Result, StepError, Suspension, WorkflowError};
use super::worker::{JobDisposition, JobProcessor};
use crate::core::{from_json, to_json};
use crate::queue::{Finished, JobFailure, JobQueue, JobState, LockedJob, NewJob, ParentRef};
use crate::storage::SuspensionRecord;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Job id of the PendingWait for `event` on `run_id`.
pub fn pending_wait_id(run_id: &str, event: &str) -> String {
    format!("{}:{}", run_id, event)
}

/// Payload of a PendingWait job; empty until an event is emitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingWaitData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Return value of a settled PendingWait job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PendingWaitOutcome {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Timedout,
}

impl From<PendingWaitOutcome> for SuspensionRecord {
    fn from(outcome: PendingWaitOutcome) -> Self {
        match outcome {
            PendingWaitOutcome::Success { data } => SuspensionRecord::Done { data },
            PendingWaitOutcome::Timedout => SuspensionRecord::Timedout,
        }
    }
}

fn record_value<T: DeserializeOwned>(record: SuspensionRecord) -> std::result::Result<Option<T>, StepError> {
    match record {
        SuspensionRecord::Done { data } => Ok(Some(from_json(data.unwrap_or(Value::Null))?)),
        SuspensionRecord::Timedout => Ok(None),
    }
}

impl Step {
    /// Waits, durably, for `event` to be emitted for this run.
    ///
    /// Returns `Ok(Some(payload))` once the event arrived and `Ok(None)` if
    /// the timeout passed first. Until then it returns
    /// `StepError::Suspended`, which the handler should propagate with `?`.
    ///
    /// # Example
    /// ```ignore
    /// let approval: Option<Approval> = step
    ///     .wait_for_event("approval", WaitForEventOptions::timeout(Duration::from_secs(3600)))
    ///     .await?;
    /// ```
    pub async fn wait_for_event<T: DeserializeOwned>(
        &self,
        id: &str,
        options: WaitForEventOptions,
    ) -> std::result::Result<Option<T>, StepError> {
        let ctx = &self.ctx;
        if let Some(record) = ctx.cache.marker(id)? {
            debug!(wait.id = %id, "wait already settled");
            return record_value(record);
        }

        ctx.ensure_runnable(id)?;

        let child_id = pending_wait_id(&ctx.run_id, id);
        let suspension = Suspension::WaitingOnChildren {
            id: id.to_string(),
            child_job_id: child_id.clone(),
        };

        let Some(child) = ctx.events.get_job(&child_id).await? else {
            ctx.try_suspend(suspension.clone())
                .map_err(StepError::Suspended)?;

            let timeout = options.timeout.unwrap_or(ctx.default_event_timeout);
            let job = NewJob::new(child_id, id, to_json(&PendingWaitData::default())?)
                .with_delay(timeout)
                .with_parent(ParentRef::new(ctx.primary_queue.clone(), ctx.run_id.clone()));
            if let Err(e) = ctx.events.add(job).await {
                ctx.clear_suspension(&suspension);
                return Err(e.into());
            }
            debug!(wait.id = %id, ?timeout, "registered pending wait");
            return Err(StepError::Suspended(suspension));
        };

        match child.finished() {
            Some(Finished::Completed(value)) => {
                let outcome: PendingWaitOutcome = from_json(value)?;
                let record = SuspensionRecord::from(outcome);
                ctx.cache.record_marker(id, &record).await?;
                record_value(record)
            }
            Some(Finished::Failed(failure)) => Err(WorkflowError::PendingWaitFailed {
                run_id: ctx.run_id.clone(),
                event: id.to_string(),
                reason: failure.failed_reason,
            }
            .into()),
            // Redelivered before the wait settled: park again on the same child.
            None => {
                ctx.try_suspend(suspension.clone())
                    .map_err(StepError::Suspended)?;
                Err(StepError::Suspended(suspension))
            }
        }
    }
}

/// Delivers `data` to the outstanding wait for `event` on `run_id`.
pub(crate) async fn emit(events: &dyn JobQueue, run_id: &str, event: &str, data: Value) -> Result<()> {
    let child_id = pending_wait_id(run_id, event);
    let not_found = || WorkflowError::PendingWaitNotFound {
        run_id: run_id.to_string(),
        event: event.to_string(),
    };

    let job = events.get_job(&child_id).await?.ok_or_else(not_found)?;
    if job.state != JobState::Delayed {
        return Err(not_found());
    }

    events
        .update_data(&child_id, to_json(&PendingWaitData { data: Some(data) })?)
        .await?;
    events.change_delay(&child_id, Duration::ZERO).await?;
    debug!(run.id = %run_id, event = %event, "event emitted");
    Ok(())
}

/// Settles PendingWait jobs on the companion queue.
pub(crate) struct PendingWaitProcessor {
    primary: Arc<dyn JobQueue>,
}

impl PendingWaitProcessor {
    pub(crate) fn new(primary: Arc<dyn JobQueue>) -> Self {
        Self { primary }
    }
}

#[async_trait]
impl JobProcessor for PendingWaitProcessor {
    async fn process(&self, locked: &LockedJob) -> JobDisposition {
        let job = &locked.job;

        let Some(parent) = job.parent.as_ref() else {
            return JobDisposition::fail(JobFailure::new("pending wait has no parent run", ""), true);
        };
        match self.primary.get_job(&parent.id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(job.id = %job.id, run.id = %parent.id, "parent run is gone");
                return JobDisposition::fail(
                    JobFailure::new(format!("parent run {} not found", parent.id), ""),
                    true,
                );
            }
            Err(e) => return JobDisposition::fail(JobFailure::new(e.to_string(), ""), false),
        }

        let payload: PendingWaitData = match from_json(job.data.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return JobDisposition::fail(
                    JobFailure::new(format!("malformed pending wait payload: {}", e), ""),
                    true,
                )
            }
        };

        let outcome = match payload.data {
            Some(data) if !data.is_null() => PendingWaitOutcome::Success { data: Some(data) },
            _ => PendingWaitOutcome::Timedout,
        };
        match to_json(&outcome) {
            Ok(value) => JobDisposition::Complete(value),
            Err(e) => JobDisposition::fail(JobFailure::new(e.to_string(), ""), true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::context::tests::invocation;
    use crate::queue::{InMemoryBroker, QueueBroker};
    use crate::storage::{InMemoryStepStore, StepStore};
    use serde_json::json;

    struct Fixture {
        store: Arc<dyn StepStore>,
        broker: InMemoryBroker,
        primary: Arc<dyn JobQueue>,
        events: Arc<dyn JobQueue>,
    }

    async fn fixture(run_id: &str) -> Fixture {
        let broker = InMemoryBroker::new();
        let primary = broker.queue("wf");
        let events = broker.queue("wf-events");
        primary
            .add(NewJob::new(run_id, "wf", json!(null)))
            .await
            .unwrap();
        Fixture {
            store: Arc::new(InMemoryStepStore::new()),
            broker,
            primary,
            events,
        }
    }

    async fn settle_next(f: &Fixture) {
        let processor = PendingWaitProcessor::new(Arc::clone(&f.primary));
        let locked = f.events.next_job().await.unwrap().unwrap();
        match processor.process(&locked).await {
            JobDisposition::Complete(value) => f
                .events
                .complete(&locked.job.id, locked.token, value)
                .await
                .unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_registers_child_and_suspends() {
        let f = fixture("r").await;
        let step = invocation(&f.store, &f.broker, "r").await;

        let err = step
            .wait_for_event::<u32>("approval", WaitForEventOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_suspended());

        let child = f.events.get_job("r:approval").await.unwrap().unwrap();
        assert_eq!(child.state, JobState::Delayed);
        assert_eq!(child.parent, Some(ParentRef::new("wf", "r")));
    }

    #[tokio::test]
    async fn test_timeout_yields_none_and_caches_timedout() {
        let f = fixture("r").await;
        let step = invocation(&f.store, &f.broker, "r").await;
        let _ = step
            .wait_for_event::<u32>("evt", WaitForEventOptions::timeout(Duration::ZERO))
            .await
            .unwrap_err();

        settle_next(&f).await;

        let resumed = invocation(&f.store, &f.broker, "r").await;
        let value = resumed
            .wait_for_event::<u32>("evt", WaitForEventOptions::default())
            .await
            .unwrap();
        assert_eq!(value, None);
        assert_eq!(resumed.cached_steps()["evt:marker"], json!({ "status": "timedout" }));
    }

    #[tokio::test]
    async fn test_emitted_payload_is_returned() {
        let f = fixture("r").await;
        let step = invocation(&f.store, &f.broker, "r").await;
        let _ = step
            .wait_for_event::<u32>("evt", WaitForEventOptions::default())
            .await
            .unwrap_err();

        emit(f.events.as_ref(), "r", "evt", json!(41)).await.unwrap();
        settle_next(&f).await;

        let resumed = invocation(&f.store, &f.broker, "r").await;
        let value = resumed
            .wait_for_event::<u32>("evt", WaitForEventOptions::default())
            .await
            .unwrap();
        assert_eq!(value, Some(41));
    }

    #[tokio::test]
    async fn test_emit_without_wait_fails() {
        let f = fixture("r").await;
        let err = emit(f.events.as_ref(), "r", "nobody", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::PendingWaitNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unsettled_child_is_not_duplicated() {
        let f = fixture("r").await;
        let first = invocation(&f.store, &f.broker, "r").await;
        let _ = first
            .wait_for_event::<u32>("evt", WaitForEventOptions::default())
            .await
            .unwrap_err();

        let again = invocation(&f.store, &f.broker, "r").await;
        let err = again
            .wait_for_event::<u32>("evt", WaitForEventOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_suspended());
        assert!(f.events.get_job("r:evt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_orphaned_wait_fails_unrecoverably() {
        let broker = InMemoryBroker::new();
        let primary = broker.queue("wf");
        let events = broker.queue("wf-events");
        let processor = PendingWaitProcessor::new(Arc::clone(&primary));

        events
            .add(NewJob::new("ghost:evt", "evt", json!({})))
            .await
            .unwrap();
        let locked = events.next_job().await.unwrap().unwrap();
        match processor.process(&locked).await {
            JobDisposition::Fail { unrecoverable, .. } => assert!(unrecoverable),
            other => panic!("unexpected {:?}", other),
        }
    }
}
