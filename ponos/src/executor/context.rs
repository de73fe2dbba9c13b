//! Per-invocation run state and the `Step` API handed to handlers.
//!
//! A [`RunContext`] lives for exactly one invocation of a run. It owns the
//! step cache snapshot and the run's suspension slot: the first suspension
//! primitive that claims the slot decides how the invocation ends, even if
//! the handler catches the returned error and keeps going.

use super::error::{classify, BoxError, ErrorClass, StepError, Suspension};
use crate::core::{from_json, to_json, Failure, Outcome, RetryPolicy};
use crate::queue::JobQueue;
use crate::storage::StepCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Options for [`Step::run_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepOptions {
    pub retry: RetryPolicy,
}

impl StepOptions {
    /// Up to `max_attempts` attempts, retried immediately.
    pub fn max_attempts(max_attempts: u32) -> Self {
        Self {
            retry: RetryPolicy::immediate(max_attempts),
        }
    }

    pub fn with_retry(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Waits between attempts, starting at `initial` and multiplying by
    /// `multiplier` up to `max`.
    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.retry.initial_delay = initial;
        self.retry.max_delay = max;
        self.retry.backoff_multiplier = multiplier;
        self
    }
}

/// Options for [`Step::wait_for_event`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitForEventOptions {
    /// How long to wait before giving up. Defaults to the workflow's
    /// `default_event_timeout`.
    pub timeout: Option<Duration>,
}

impl WaitForEventOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one invocation of one run.
pub struct RunContext {
    pub(crate) workflow_id: String,
    pub(crate) run_id: String,
    pub(crate) cache: StepCache,
    /// Companion queue holding this run's pending waits.
    pub(crate) events: Arc<dyn JobQueue>,
    /// Name of the queue the run's own job lives in.
    pub(crate) primary_queue: String,
    pub(crate) default_event_timeout: Duration,
    suspension: Mutex<Option<Suspension>>,
    fatal: Mutex<Option<Failure>>,
}

impl RunContext {
    pub(crate) fn new(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        cache: StepCache,
        events: Arc<dyn JobQueue>,
        primary_queue: impl Into<String>,
        default_event_timeout: Duration,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            cache,
            events,
            primary_queue: primary_queue.into(),
            default_event_timeout,
            suspension: Mutex::new(None),
            fatal: Mutex::new(None),
        }
    }

    /// Claims the suspension slot. Returns the current holder if taken.
    pub(crate) fn try_suspend(&self, suspension: Suspension) -> Result<(), Suspension> {
        let mut slot = lock(&self.suspension);
        match slot.as_ref() {
            Some(existing) => Err(existing.clone()),
            None => {
                debug!(run.id = %self.run_id, %suspension, "run suspending");
                *slot = Some(suspension);
                Ok(())
            }
        }
    }

    /// Gives the slot back after a suspension failed to take effect.
    pub(crate) fn clear_suspension(&self, suspension: &Suspension) {
        let mut slot = lock(&self.suspension);
        if slot.as_ref() == Some(suspension) {
            *slot = None;
        }
    }

    pub(crate) fn suspension(&self) -> Option<Suspension> {
        lock(&self.suspension).clone()
    }

    /// Records an unrecoverable failure; the first one is kept.
    pub(crate) fn mark_fatal(&self, failure: Failure) {
        let mut slot = lock(&self.fatal);
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    pub(crate) fn fatal(&self) -> Option<Failure> {
        lock(&self.fatal).clone()
    }

    /// Refuses new work once the invocation is suspending or failed.
    pub(crate) fn ensure_runnable(&self, step_id: &str) -> Result<(), StepError> {
        if let Some(suspension) = self.suspension() {
            return Err(StepError::Suspended(suspension));
        }
        if let Some(failure) = self.fatal() {
            return Err(StepError::Fatal {
                step_id: step_id.to_string(),
                message: failure.failed_reason,
            });
        }
        Ok(())
    }
}

/// Handle through which a workflow handler runs durable steps.
///
/// Cheap to clone: clones share the same invocation.
#[derive(Clone)]
pub struct Step {
    pub(crate) ctx: Arc<RunContext>,
}

impl Step {
    pub(crate) fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    pub fn workflow_id(&self) -> &str {
        &self.ctx.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.ctx.run_id
    }

    /// Every record this invocation knows about, keyed by field.
    pub fn cached_steps(&self) -> HashMap<String, Value> {
        self.ctx.cache.cached_steps()
    }

    /// Runs `body` once per run, with a single attempt.
    ///
    /// See [`Step::run_with`].
    pub async fn run<T, E, F, Fut>(&self, step_id: &str, body: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        E: Into<BoxError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(step_id, StepOptions::default(), body).await
    }

    /// Runs `body` as the durable step `step_id`.
    ///
    /// Attempts are numbered from 1. A recorded success is returned without
    /// running the body; a recorded failure moves on to the next attempt.
    /// The first attempt without a record runs the body and records what it
    /// returned. Once every attempt has failed, the last failure is returned
    /// as `StepError::Failed`.
    ///
    /// A body failing with [`Unrecoverable`](super::Unrecoverable) is not
    /// recorded and fails the run without retries.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let receipt = step
    ///     .run_with("charge", StepOptions::max_attempts(3), || async {
    ///         payments.charge(order.total).await
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_with<T, E, F, Fut>(
        &self,
        step_id: &str,
        options: StepOptions,
        mut body: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        E: Into<BoxError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ctx = &self.ctx;
        let policy = options.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut last_failure: Option<Failure> = None;

        for attempt in 1..=max_attempts {
            match ctx.cache.attempt(step_id, attempt)? {
                Some(Outcome::Success { value }) => {
                    debug!(step.id = %step_id, attempt, "step replayed from cache");
                    return Ok(from_json(value)?);
                }
                Some(Outcome::Failure { error }) => {
                    last_failure = Some(error);
                    continue;
                }
                None => {}
            }

            ctx.ensure_runnable(step_id)?;

            let err: BoxError = match body().await {
                Ok(value) => {
                    let recorded = Outcome::succeed(to_json(&value)?);
                    ctx.cache.record_attempt(step_id, attempt, &recorded).await?;
                    debug!(step.id = %step_id, attempt, "step succeeded");
                    return Ok(value);
                }
                Err(err) => err.into(),
            };

            match classify(err.as_ref()) {
                ErrorClass::Recoverable => {
                    let failure = Failure::from_error(err.as_ref());
                    ctx.cache
                        .record_attempt(step_id, attempt, &Outcome::fail(failure.clone()))
                        .await?;
                    debug!(
                        step.id = %step_id,
                        attempt,
                        max_attempts,
                        error = %failure.failed_reason,
                        "step attempt failed"
                    );
                    if let Some(delay) = policy.delay_for_attempt(attempt) {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    last_failure = Some(failure);
                }
                ErrorClass::Unrecoverable => {
                    let failure = Failure::from_error(err.as_ref());
                    warn!(step.id = %step_id, attempt, error = %failure.failed_reason, "step failed unrecoverably");
                    let message = failure.failed_reason.clone();
                    ctx.mark_fatal(failure);
                    return Err(StepError::Fatal {
                        step_id: step_id.to_string(),
                        message,
                    });
                }
                ErrorClass::Suspension => {
                    return Err(match err.downcast::<StepError>() {
                        Ok(inner) => *inner,
                        Err(other) => StepError::Fatal {
                            step_id: step_id.to_string(),
                            message: other.to_string(),
                        },
                    });
                }
            }
        }

        let failure = last_failure
            .unwrap_or_else(|| Failure::new(format!("step {} has no attempts", step_id), ""));
        Err(StepError::Failed {
            step_id: step_id.to_string(),
            failure,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::executor::Unrecoverable;
    use crate::queue::{InMemoryBroker, QueueBroker};
    use crate::storage::{InMemoryStepStore, StepStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A fresh invocation of `run_id` against `store`.
    pub(crate) async fn invocation(
        store: &Arc<dyn StepStore>,
        broker: &InMemoryBroker,
        run_id: &str,
    ) -> Step {
        let cache = StepCache::load(Arc::clone(store), "wf", run_id).await.unwrap();
        let ctx = RunContext::new(
            "wf",
            run_id,
            cache,
            broker.queue("wf-events"),
            "wf",
            Duration::from_secs(3600),
        );
        Step::new(Arc::new(ctx))
    }

    fn setup() -> (Arc<dyn StepStore>, InMemoryBroker) {
        (Arc::new(InMemoryStepStore::new()), InMemoryBroker::new())
    }

    #[tokio::test]
    async fn test_success_is_replayed_without_running_body() {
        let (store, broker) = setup();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let step = invocation(&store, &broker, "r").await;
            let calls = Arc::clone(&calls);
            let value: u32 = step
                .run("a", move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(7)
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_and_record_every_attempt() {
        let (store, broker) = setup();
        let step = invocation(&store, &broker, "r").await;

        let err = step
            .run_with("flaky", StepOptions::max_attempts(3), || async {
                Err::<u32, _>("still down")
            })
            .await
            .unwrap_err();
        assert_eq!(err.failure().unwrap().failed_reason, "still down");

        let attempts = step.ctx.cache.attempts("flaky").unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| a.is_failure()));
    }

    #[tokio::test]
    async fn test_cached_failures_advance_to_next_attempt() {
        let (store, broker) = setup();
        let first = invocation(&store, &broker, "r").await;
        let _ = first
            .run("b", || async { Err::<u32, _>("Oh no!") })
            .await
            .unwrap_err();

        let second = invocation(&store, &broker, "r").await;
        let value = second
            .run_with("b", StepOptions::max_attempts(2), || async {
                Ok::<_, BoxError>(5u32)
            })
            .await
            .unwrap();
        assert_eq!(value, 5);

        let attempts = second.ctx.cache.attempts("b").unwrap();
        assert!(attempts[0].is_failure());
        assert!(attempts[1].is_success());
    }

    #[tokio::test]
    async fn test_all_cached_failures_reraise_without_body() {
        let (store, broker) = setup();
        let first = invocation(&store, &broker, "r").await;
        let _ = first
            .run("c", || async { Err::<u32, _>("nope") })
            .await
            .unwrap_err();

        let second = invocation(&store, &broker, "r").await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = second
            .run("c", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, BoxError>(0) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unrecoverable_is_not_recorded() {
        let (store, broker) = setup();
        let step = invocation(&store, &broker, "r").await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let err = step
            .run_with("fatal", StepOptions::max_attempts(5), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(Unrecoverable::new("card stolen"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Fatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(step.ctx.cache.attempts("fatal").unwrap().is_empty());
        assert_eq!(step.ctx.fatal().unwrap().failed_reason, "card stolen");

        // Later steps in the same invocation are refused.
        let refused = step
            .run("after", || async { Ok::<_, BoxError>(1u32) })
            .await
            .unwrap_err();
        assert!(matches!(refused, StepError::Fatal { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_steps_use_disjoint_records() {
        let (store, broker) = setup();
        let step = invocation(&store, &broker, "r").await;

        let (a, b) = tokio::join!(
            step.run("a", || async { Ok::<_, BoxError>("A".to_string()) }),
            step.run("b", || async { Ok::<_, BoxError>("B".to_string()) }),
        );
        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");
        assert_eq!(step.cached_steps().len(), 2);
    }

    #[tokio::test]
    async fn test_first_started_step_finishing_last_keeps_its_records() {
        let (store, broker) = setup();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let fast_calls = Arc::new(AtomicU32::new(0));

        let step = invocation(&store, &broker, "r").await;
        let (slow, fast) = tokio::join!(
            step.run("slow", || {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    finished.lock().unwrap().push("slow");
                    Ok::<_, BoxError>("S".to_string())
                }
            }),
            step.run_with("fast", StepOptions::max_attempts(2), || {
                let finished = Arc::clone(&finished);
                let fast_calls = Arc::clone(&fast_calls);
                async move {
                    if fast_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err::<String, BoxError>("first try".into());
                    }
                    finished.lock().unwrap().push("fast");
                    Ok("F".to_string())
                }
            }),
        );
        assert_eq!(*finished.lock().unwrap(), vec!["fast", "slow"]);
        assert_eq!(slow.unwrap(), "S");
        assert_eq!(fast.unwrap(), "F");

        let replay = invocation(&store, &broker, "r").await;
        let (slow, fast) = tokio::join!(
            replay.run("slow", || async { Err::<String, _>("slow ran again") }),
            replay.run_with("fast", StepOptions::max_attempts(2), || async {
                Err::<String, _>("fast ran again")
            }),
        );
        assert_eq!(slow.unwrap(), "S");
        assert_eq!(fast.unwrap(), "F");

        let attempts = replay.ctx.cache.attempts("fast").unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].error().unwrap().failed_reason, "first try");
        assert_eq!(attempts[1], Outcome::succeed(serde_json::json!("F")));
        assert_eq!(replay.ctx.cache.attempts("slow").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_suspension_wins() {
        let (store, broker) = setup();
        let step = invocation(&store, &broker, "r").await;

        let first = Suspension::Delayed {
            id: "nap".to_string(),
            until: chrono::Utc::now(),
        };
        let second = Suspension::WaitingOnChildren {
            id: "evt".to_string(),
            child_job_id: "r:evt".to_string(),
        };
        assert!(step.ctx.try_suspend(first.clone()).is_ok());
        assert_eq!(step.ctx.try_suspend(second), Err(first.clone()));
        assert_eq!(step.ctx.suspension(), Some(first));
    }
}
