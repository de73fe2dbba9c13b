//! Ponos: durable step-function workflows for Rust
//!
//! `ponos` (πόνος, Greek for "toil") runs workflow handlers as durable step
//! functions on top of a job queue. A handler is an ordinary async function
//! that receives its input and a [`Step`](executor::Step) handle. Work done
//! through the handle is memoized per run, so the handler can be replayed
//! from the top on every delivery of the run's job and pick up where it
//! left off.
//!
//! # Features
//!
//! - **Memoized steps**: `step.run` records every attempt; recorded
//!   successes are never recomputed
//! - **Retries**: per-step attempts with optional backoff, plus job-level
//!   attempts for the whole run
//! - **Durable sleep**: `step.sleep` parks the run's job instead of a worker
//! - **Events**: `step.wait_for_event` suspends until `emit_event` delivers
//!   a payload or the timeout elapses
//! - **Pluggable backends**: in-memory by default, Redis step store behind
//!   the `redis` feature
//!
//! # Quick Start
//!
//! ```no_run
//! use ponos::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = Workflow::builder("hello").build(|name: String, step: Step| async move {
//!         let upper: String = step
//!             .run("shout", || {
//!                 let name = name.clone();
//!                 async move { Ok::<_, BoxError>(name.to_uppercase()) }
//!             })
//!             .await?;
//!         Ok::<_, BoxError>(format!("Hello, {}!", upper))
//!     });
//!
//!     let run = workflow.start("run-1", &"world".to_string()).await?;
//!     println!("{:?}", run.get_result().await?);
//!     workflow.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: result algebra, serialization and retry policy
//! - [`storage`]: the write-once step store and the per-run step cache
//! - [`queue`]: the job-queue substrate runs are scheduled on
//! - [`executor`]: the replay engine and the workflow runtime

pub mod core;
pub mod executor;
pub mod queue;
pub mod storage;

pub use core::{CoreError, Failure, Outcome, RetryPolicy};

pub use executor::{
    BoxError, RunHandle, RunResult, StartOptions, Step, StepError, StepOptions, Unrecoverable,
    WaitForEventOptions, Workflow, WorkflowBuilder, WorkflowConfig, WorkflowError,
};

pub use queue::{InMemoryBroker, JobQueue, JobState, QueueBroker, QueueError};

pub use storage::{InMemoryStepStore, StepStore, StorageError};

#[cfg(feature = "redis")]
pub use storage::RedisStepStore;

// Re-export dependencies used in the public API
pub use serde;
pub use serde_json;
pub use tokio;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use ponos::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{Failure, Outcome, RetryPolicy};

    pub use crate::executor::{
        BoxError, RunHandle, RunResult, StartOptions, Step, StepError, StepOptions, Unrecoverable,
        WaitForEventOptions, Workflow, WorkflowConfig, WorkflowError,
    };

    pub use crate::parallel;

    pub use crate::queue::{InMemoryBroker, JobState};

    pub use crate::storage::{InMemoryStepStore, StepStore};

    #[cfg(feature = "redis")]
    pub use crate::storage::RedisStepStore;

    pub use serde::{Deserialize, Serialize};
    pub use std::sync::Arc;
    pub use std::time::Duration;
}
