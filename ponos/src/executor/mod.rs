//! Execution layer: the replay engine and the workflow runtime.
//!
//! Module organization:
//! - context: the per-invocation `RunContext` and the
//!   [`Step`] API (`run`, `run_with`)
//! - timer: durable `Step::sleep`
//! - signal: durable `Step::wait_for_event` and event delivery
//! - run: one invocation of one run and how it maps to a job outcome
//! - worker: generic queue workers
//! - workflow: registering handlers, starting runs, reading results

mod config;
pub(crate) mod context;
mod error;
mod run;
mod signal;
mod timer;
mod worker;
mod workflow;

pub use config::WorkflowConfig;
pub use context::{Step, StepOptions, WaitForEventOptions};
pub use error::{
    classify, BoxError, ErrorClass, Result, RunOutcome, StepError, Suspension, Unrecoverable,
    WorkflowError,
};
pub use run::{BoxedHandler, HandlerFuture};
pub use signal::{pending_wait_id, PendingWaitData, PendingWaitOutcome};
pub use worker::{JobDisposition, JobProcessor, Worker, WorkerHandle};
pub use workflow::{RunHandle, RunResult, StartOptions, Workflow, WorkflowBuilder};

/// Runs independent steps concurrently.
///
/// Sugar over `tokio::join!`; results come back as a tuple in argument
/// order. Each step keeps its own records, so concurrent steps replay no
/// matter which finished first.
///
/// ```ignore
/// let (a, b) = parallel!(
///     step.run("a", || async { Ok::<_, BoxError>(1) }),
///     step.run("b", || async { Ok::<_, BoxError>(2) }),
/// );
/// ```
#[macro_export]
macro_rules! parallel {
    ($($future:expr),+ $(,)?) => {
        $crate::tokio::join!($($future),+)
    };
}
