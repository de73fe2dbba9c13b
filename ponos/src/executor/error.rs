use crate::core::{CoreError, Failure};
use crate::queue::QueueError;
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// A boxed error that can be sent across threads.
///
/// Step bodies and handlers may fail with any error type; it is boxed into
/// this before being recorded or classified.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Runtime error type for the workflow layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step store operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A job-queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// A serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// `start` was called with a run id that already exists.
    #[error("run {run_id} already exists in workflow {workflow_id}")]
    DuplicateRun { workflow_id: String, run_id: String },

    /// No run with this id exists.
    #[error("run {run_id} not found in workflow {workflow_id}")]
    RunNotFound { workflow_id: String, run_id: String },

    /// `emit_event` found no outstanding wait for the event.
    #[error("no pending wait for event {event} on run {run_id}")]
    PendingWaitNotFound { run_id: String, event: String },

    /// The companion job behind a wait failed instead of settling.
    #[error("wait for event {event} on run {run_id} failed: {reason}")]
    PendingWaitFailed {
        run_id: String,
        event: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Why an invocation stopped without finishing the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspension {
    /// Sleeping until `until`.
    Delayed { id: String, until: DateTime<Utc> },
    /// Waiting for the companion job `child_job_id` to settle.
    WaitingOnChildren { id: String, child_job_id: String },
}

impl Suspension {
    /// The sleep or wait id that suspended the run.
    pub fn id(&self) -> &str {
        match self {
            Suspension::Delayed { id, .. } => id,
            Suspension::WaitingOnChildren { id, .. } => id,
        }
    }
}

impl fmt::Display for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suspension::Delayed { id, until } => write!(f, "sleeping on {} until {}", id, until),
            Suspension::WaitingOnChildren { id, child_job_id } => {
                write!(f, "waiting on {} ({})", id, child_job_id)
            }
        }
    }
}

/// Error returned to handlers by the `Step` API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StepError {
    /// Every attempt of the step failed. Displays the last failure's message.
    #[error("{failure}")]
    Failed { step_id: String, failure: Failure },

    /// The run is suspending. Propagate it; the runtime resumes the handler
    /// later from the top.
    #[error("run suspended: {0}")]
    Suspended(Suspension),

    /// A step failed with an [`Unrecoverable`] error; the run fails without
    /// retries.
    #[error("step {step_id} failed unrecoverably: {message}")]
    Fatal { step_id: String, message: String },

    /// The runtime could not read or write its state.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl StepError {
    pub fn is_suspended(&self) -> bool {
        matches!(self, StepError::Suspended(_))
    }

    /// The recorded failure, for `Failed`.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            StepError::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

impl From<StorageError> for StepError {
    fn from(e: StorageError) -> Self {
        StepError::Workflow(e.into())
    }
}

impl From<QueueError> for StepError {
    fn from(e: QueueError) -> Self {
        StepError::Workflow(e.into())
    }
}

impl From<CoreError> for StepError {
    fn from(e: CoreError) -> Self {
        StepError::Workflow(e.into())
    }
}

/// Marks an error as not worth retrying.
///
/// Returned from a step body, it skips the remaining attempts, is not
/// recorded, and fails the whole run without job-level retries.
///
/// ```
/// use ponos::executor::Unrecoverable;
///
/// let err = Unrecoverable::new("card reported stolen");
/// assert_eq!(err.to_string(), "card reported stolen");
/// ```
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Unrecoverable {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl Unrecoverable {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an existing error, keeping it as the source.
    pub fn wrap(error: impl Into<BoxError>) -> Self {
        let source = error.into();
        Self {
            message: source.to_string(),
            source: Some(source),
        }
    }
}

/// How the replay engine treats an error coming out of a step body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recorded as a failed attempt and retried while attempts remain.
    Recoverable,
    /// Propagated immediately without a record; fails the run.
    Unrecoverable,
    /// A suspension raised by a nested primitive; propagated as is.
    Suspension,
}

/// Classifies an error returned by a step body.
pub fn classify(error: &(dyn std::error::Error + Send + Sync + 'static)) -> ErrorClass {
    if error.downcast_ref::<Unrecoverable>().is_some() {
        return ErrorClass::Unrecoverable;
    }
    match error.downcast_ref::<StepError>() {
        Some(StepError::Suspended(_)) => ErrorClass::Suspension,
        Some(StepError::Fatal { .. }) => ErrorClass::Unrecoverable,
        _ => ErrorClass::Recoverable,
    }
}

/// A run invocation can complete, fail or suspend. Be honest about it.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The handler returned a value.
    Completed(Value),
    /// The handler failed. `unrecoverable` skips job-level retries.
    Failed {
        failure: Failure,
        unrecoverable: bool,
    },
    /// The handler reached a suspension point.
    Suspended(Suspension),
}
