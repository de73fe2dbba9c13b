//! One invocation of one run.
//!
//! Every delivery of a run's job replays the handler from the top against the
//! run's step cache. What the invocation produced is read off in a fixed
//! order: a panic fails the run outright, then a claimed suspension wins over
//! anything the handler returned, then an unrecoverable step failure, then
//! the handler's own result.

use super::context::{RunContext, Step};
use super::error::{classify, BoxError, ErrorClass, RunOutcome, Suspension};
use super::worker::{JobDisposition, JobProcessor};
use crate::core::Failure;
use crate::queue::{JobFailure, JobQueue, LockedJob};
use crate::storage::{StepCache, StepStore};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, BoxError>> + Send>>;

/// A workflow handler with its input and output erased to JSON.
pub type BoxedHandler = Arc<dyn Fn(Value, Step) -> HandlerFuture + Send + Sync>;

/// Everything an invocation needs besides the job itself.
#[derive(Clone)]
pub(crate) struct RunEnv {
    pub(crate) workflow_id: String,
    pub(crate) store: Arc<dyn StepStore>,
    pub(crate) events: Arc<dyn JobQueue>,
    pub(crate) primary_queue: String,
    pub(crate) default_event_timeout: Duration,
    pub(crate) handler: BoxedHandler,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Runs the handler once for `run_id` and reports how the invocation ended.
pub(crate) async fn invoke(env: &RunEnv, run_id: &str, input: Value) -> RunOutcome {
    let cache = match StepCache::load(Arc::clone(&env.store), &env.workflow_id, run_id).await {
        Ok(cache) => cache,
        Err(e) => {
            // Nothing ran; let job-level retries try again.
            return RunOutcome::Failed {
                failure: Failure::from_error(&e),
                unrecoverable: false,
            };
        }
    };
    debug!(cached = cache.cached_steps().len(), "step cache loaded");

    let ctx = Arc::new(RunContext::new(
        env.workflow_id.clone(),
        run_id,
        cache,
        Arc::clone(&env.events),
        env.primary_queue.clone(),
        env.default_event_timeout,
    ));
    let step = Step::new(Arc::clone(&ctx));
    let fut = (env.handler)(input, step);
    let result = match tokio::spawn(fut.in_current_span()).await {
        Ok(result) => result,
        Err(join_error) => {
            // A panic can leave a suspension claimed with nothing parked
            // behind it, so it always fails the run.
            let message = if join_error.is_panic() {
                panic_message(join_error.into_panic().as_ref())
            } else {
                join_error.to_string()
            };
            warn!(error = %message, "handler did not finish");
            return RunOutcome::Failed {
                failure: Failure::new(message.clone(), format!("Error: {}", message)),
                unrecoverable: true,
            };
        }
    };

    if let Some(suspension) = ctx.suspension() {
        return RunOutcome::Suspended(suspension);
    }
    if let Some(failure) = ctx.fatal() {
        return RunOutcome::Failed {
            failure,
            unrecoverable: true,
        };
    }

    match result {
        Ok(value) => RunOutcome::Completed(value),
        Err(err) => {
            let class = classify(err.as_ref());
            RunOutcome::Failed {
                failure: Failure::from_error(err.as_ref()),
                unrecoverable: class == ErrorClass::Unrecoverable,
            }
        }
    }
}

impl From<RunOutcome> for JobDisposition {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed(value) => JobDisposition::Complete(value),
            RunOutcome::Failed {
                failure,
                unrecoverable,
            } => JobDisposition::fail(
                JobFailure::new(failure.failed_reason, failure.stack),
                unrecoverable,
            ),
            RunOutcome::Suspended(Suspension::Delayed { until, .. }) => JobDisposition::Delay(until),
            RunOutcome::Suspended(Suspension::WaitingOnChildren { .. }) => {
                JobDisposition::WaitForChildren
            }
        }
    }
}

/// Processes jobs of a workflow's primary queue; one job is one run.
pub(crate) struct RunProcessor {
    env: RunEnv,
}

impl RunProcessor {
    pub(crate) fn new(env: RunEnv) -> Self {
        Self { env }
    }
}

#[async_trait]
impl JobProcessor for RunProcessor {
    async fn process(&self, locked: &LockedJob) -> JobDisposition {
        let job = &locked.job;
        let span = info_span!(
            "run_invocation",
            workflow.id = %self.env.workflow_id,
            run.id = %job.id,
            attempt = job.attempts_made + 1
        );
        let outcome = invoke(&self.env, &job.id, job.data.clone())
            .instrument(span)
            .await;
        match &outcome {
            RunOutcome::Completed(_) => debug!(run.id = %job.id, "run completed"),
            RunOutcome::Failed {
                failure,
                unrecoverable,
            } => {
                warn!(run.id = %job.id, error = %failure.failed_reason, unrecoverable, "run failed")
            }
            RunOutcome::Suspended(suspension) => {
                debug!(run.id = %job.id, %suspension, "run suspended")
            }
        }
        outcome.into()
    }
}
