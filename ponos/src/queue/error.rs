use super::JobState;
use thiserror::Error;

/// Error type for job-queue operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// No job with this id exists in the queue.
    #[error("job {id} not found in queue {queue}")]
    NotFound { queue: String, id: String },

    /// A job with this id was already added.
    #[error("job {id} already exists in queue {queue}")]
    DuplicateJob { queue: String, id: String },

    /// The parent named by a new job does not exist.
    #[error("parent job {id} not found in queue {queue}")]
    ParentNotFound { queue: String, id: String },

    /// The caller does not hold the job's current lock.
    #[error("lock token mismatch for job {id} in queue {queue}")]
    LockMismatch { queue: String, id: String },

    /// The job is not in a state that allows the operation.
    #[error("cannot {operation} job {id} while it is {state}")]
    InvalidState {
        id: String,
        state: JobState,
        operation: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, QueueError>;
