//! Job-queue substrate that workflow runs are scheduled on.
//!
//! A workflow owns two queues: the primary queue, where one job is one run,
//! and the companion events queue, where one job is one outstanding
//! `wait_for_event`. The runtime only needs a small set of operations from
//! the substrate, captured by [`JobQueue`]:
//!
//! - add jobs, optionally delayed and optionally linked to a parent job in
//!   another queue
//! - claim the next ready job under a lock token
//! - finish a claimed job: complete, fail (with job-level retries), delay
//!   it, or park it until its children have finished
//! - wait for a job to reach a terminal state without polling
//!
//! [`InMemoryBroker`] implements the substrate in process. A finished child,
//! completed or failed, releases its parent once no other child is pending.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

mod error;
pub mod memory;

pub use error::{QueueError, Result};
pub use memory::InMemoryBroker;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Not ready until its delay elapses.
    Delayed,
    /// Claimed by a worker under a lock token.
    Active,
    /// Parked until every child job has finished.
    WaitingChildren,
    Completed,
    Failed,
}

impl JobState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::WaitingChildren => "waiting-children",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// True for `Completed` and `Failed`.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A job in another (or the same) queue that this job reports to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub queue: String,
    pub id: String,
}

impl ParentRef {
    pub fn new(queue: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            id: id.into(),
        }
    }
}

/// Failure information stored on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub failed_reason: String,
    pub stacktrace: String,
}

impl JobFailure {
    pub fn new(failed_reason: impl Into<String>, stacktrace: impl Into<String>) -> Self {
        Self {
            failed_reason: failed_reason.into(),
            stacktrace: stacktrace.into(),
        }
    }
}

/// A job to be added to a queue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub name: String,
    pub data: Value,
    /// Keep the job delayed for this long before it becomes ready.
    pub delay: Option<Duration>,
    pub parent: Option<ParentRef>,
    /// Total number of times the job may be processed (at least 1).
    pub attempts: u32,
}

impl NewJob {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data,
            delay: None,
            parent: None,
            attempts: 1,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }
}

/// Snapshot of a job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub state: JobState,
    pub parent: Option<ParentRef>,
    pub attempts: u32,
    /// Number of processing attempts that ended in failure.
    pub attempts_made: u32,
    /// When a delayed job becomes ready.
    pub ready_at: Option<DateTime<Utc>>,
    pub return_value: Option<Value>,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The terminal result, if the job has finished.
    pub fn finished(&self) -> Option<Finished> {
        match self.state {
            JobState::Completed => Some(Finished::Completed(
                self.return_value.clone().unwrap_or(Value::Null),
            )),
            JobState::Failed => Some(Finished::Failed(
                self.failure
                    .clone()
                    .unwrap_or_else(|| JobFailure::new("job failed", "")),
            )),
            _ => None,
        }
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Finished {
    Completed(Value),
    Failed(JobFailure),
}

/// A claimed job and the token that proves the claim.
#[derive(Debug, Clone)]
pub struct LockedJob {
    pub job: Job,
    pub token: Uuid,
}

/// Operations the workflow runtime needs from a queue.
///
/// Every operation on a claimed job takes the lock token handed out by
/// [`JobQueue::next_job`] and fails with `QueueError::LockMismatch` when the
/// token is stale.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue name.
    fn name(&self) -> &str;

    /// Adds a job. Fails with `DuplicateJob` if the id is taken.
    async fn add(&self, job: NewJob) -> Result<Job>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Replaces the payload of a job that has not finished.
    async fn update_data(&self, id: &str, data: Value) -> Result<()>;

    /// Reschedules a delayed job to become ready `delay` from now.
    async fn change_delay(&self, id: &str, delay: Duration) -> Result<()>;

    /// Claims the oldest ready job, promoting delayed jobs whose time came.
    async fn next_job(&self) -> Result<Option<LockedJob>>;

    /// Releases a claimed job and keeps it delayed until `until`.
    async fn move_to_delayed(&self, id: &str, token: Uuid, until: DateTime<Utc>) -> Result<()>;

    /// Parks a claimed job until its children have finished.
    ///
    /// Returns `false` if no child is pending; the job is then put back in
    /// the waiting state so it runs again.
    async fn move_to_waiting_children(&self, id: &str, token: Uuid) -> Result<bool>;

    /// Completes a claimed job and releases its parent.
    async fn complete(&self, id: &str, token: Uuid, value: Value) -> Result<()>;

    /// Fails a claimed job.
    ///
    /// The job goes back to waiting while attempts remain, unless
    /// `unrecoverable` is set. Returns the state the job ended up in.
    async fn fail(
        &self,
        id: &str,
        token: Uuid,
        failure: JobFailure,
        unrecoverable: bool,
    ) -> Result<JobState>;

    /// Waits until the job is completed or failed.
    async fn wait_until_finished(&self, id: &str) -> Result<Finished>;

    /// Earliest time a delayed job becomes ready.
    async fn next_ready_at(&self) -> Option<DateTime<Utc>>;

    /// Notified whenever a job may have become ready.
    fn work_notify(&self) -> Arc<Notify>;
}

/// Hands out named queues that can link jobs across each other.
pub trait QueueBroker: Send + Sync {
    fn queue(&self, name: &str) -> Arc<dyn JobQueue>;
}
