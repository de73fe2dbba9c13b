//! Workflow runtime: registration, starting runs and delivering events.

use super::config::WorkflowConfig;
use super::context::Step;
use super::error::{BoxError, Result, Unrecoverable, WorkflowError};
use super::run::{BoxedHandler, HandlerFuture, RunEnv, RunProcessor};
use super::signal::{emit, PendingWaitProcessor};
use super::worker::{Worker, WorkerHandle};
use crate::core::{from_json, to_json};
use crate::queue::{Finished, InMemoryBroker, JobQueue, JobState, NewJob, QueueBroker, QueueError};
use crate::storage::{InMemoryStepStore, StepCache, StepOutcome, StepStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Options for [`Workflow::start_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Total number of times the run's job may be processed after a failure.
    pub attempts: u32,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self { attempts: 1 }
    }
}

impl StartOptions {
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult<R> {
    Success { result: R },
    Failure { failed_reason: String, stacktrace: String },
}

impl<R> RunResult<R> {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success { .. })
    }
}

/// Builder for a [`Workflow`].
///
/// Defaults to an in-memory broker and step store.
pub struct WorkflowBuilder {
    id: String,
    config: WorkflowConfig,
    broker: Arc<dyn QueueBroker>,
    store: Arc<dyn StepStore>,
}

impl WorkflowBuilder {
    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn broker(mut self, broker: impl QueueBroker + 'static) -> Self {
        self.broker = Arc::new(broker);
        self
    }

    pub fn store(mut self, store: impl StepStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// Registers `handler` and starts the workflow's two workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build<I, R, E, F, Fut>(self, handler: F) -> Workflow<I, R>
    where
        I: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        E: Into<BoxError>,
        F: Fn(I, Step) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |input: Value, step: Step| -> HandlerFuture {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                // An input that does not decode will never decode; don't retry it.
                let input: I = from_json(input).map_err(|e| -> BoxError { Box::new(Unrecoverable::wrap(e)) })?;
                let output = (*handler)(input, step).await.map_err(|e| -> BoxError { e.into() })?;
                Ok::<Value, BoxError>(to_json(&output)?)
            })
        });

        let primary = self.broker.queue(&self.id);
        let events = self.broker.queue(&self.config.events_queue_name(&self.id));

        let env = RunEnv {
            workflow_id: self.id.clone(),
            store: Arc::clone(&self.store),
            events: Arc::clone(&events),
            primary_queue: self.id.clone(),
            default_event_timeout: self.config.default_event_timeout(),
            handler: boxed,
        };

        let run_worker = Worker::new(
            format!("{}-runs", self.id),
            Arc::clone(&primary),
            RunProcessor::new(env),
        )
        .with_max_concurrent_jobs(self.config.concurrency)
        .with_poll_interval(self.config.poll_interval())
        .start();

        let event_worker = Worker::new(
            format!("{}-events", self.id),
            Arc::clone(&events),
            PendingWaitProcessor::new(Arc::clone(&primary)),
        )
        .with_max_concurrent_jobs(self.config.concurrency)
        .with_poll_interval(self.config.poll_interval())
        .start();

        info!(workflow.id = %self.id, events = %events.name(), "workflow registered");

        Workflow {
            id: self.id,
            store: self.store,
            primary,
            events,
            workers: Mutex::new(vec![run_worker, event_worker]),
            _types: PhantomData,
        }
    }
}

/// A registered workflow.
///
/// # Example
///
/// ```no_run
/// use ponos::prelude::*;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let workflow = Workflow::builder("greeter").build(|name: String, step: Step| async move {
///     let greeting: String = step
///         .run("greet", || {
///             let name = name.clone();
///             async move { Ok::<_, BoxError>(format!("hello {}", name)) }
///         })
///         .await?;
///     Ok::<_, BoxError>(greeting)
/// });
///
/// let run = workflow.start("run-1", &"ada".to_string()).await?;
/// assert!(run.get_result().await?.is_success());
/// # Ok(())
/// # }
/// ```
pub struct Workflow<I, R> {
    id: String,
    store: Arc<dyn StepStore>,
    primary: Arc<dyn JobQueue>,
    events: Arc<dyn JobQueue>,
    workers: Mutex<Vec<WorkerHandle>>,
    _types: PhantomData<fn(I) -> R>,
}

impl Workflow<(), ()> {
    pub fn builder(id: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            id: id.into(),
            config: WorkflowConfig::default(),
            broker: Arc::new(InMemoryBroker::new()),
            store: Arc::new(InMemoryStepStore::new()),
        }
    }
}

impl<I, R> Workflow<I, R>
where
    I: Serialize,
    R: DeserializeOwned,
{
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts a run with a single job-level attempt.
    pub async fn start(&self, run_id: &str, input: &I) -> Result<RunHandle<R>> {
        self.start_with(run_id, input, StartOptions::default()).await
    }

    /// Starts a run. Fails with `DuplicateRun` if `run_id` was used before.
    pub async fn start_with(&self, run_id: &str, input: &I, options: StartOptions) -> Result<RunHandle<R>> {
        let duplicate = || WorkflowError::DuplicateRun {
            workflow_id: self.id.clone(),
            run_id: run_id.to_string(),
        };
        if self.primary.get_job(run_id).await?.is_some() {
            return Err(duplicate());
        }

        let job = NewJob::new(run_id, self.id.as_str(), to_json(input)?).with_attempts(options.attempts);
        match self.primary.add(job).await {
            Ok(_) => {}
            Err(QueueError::DuplicateJob { .. }) => return Err(duplicate()),
            Err(e) => return Err(e.into()),
        }
        info!(workflow.id = %self.id, run.id = %run_id, attempts = options.attempts, "run started");
        Ok(self.handle(run_id))
    }

    /// Handle on an existing run.
    pub async fn run(&self, run_id: &str) -> Result<RunHandle<R>> {
        if self.primary.get_job(run_id).await?.is_none() {
            return Err(WorkflowError::RunNotFound {
                workflow_id: self.id.clone(),
                run_id: run_id.to_string(),
            });
        }
        Ok(self.handle(run_id))
    }

    /// Delivers `data` to the run's outstanding `wait_for_event(event, ..)`.
    pub async fn emit_event(&self, run_id: &str, event: &str, data: impl Serialize) -> Result<()> {
        emit(self.events.as_ref(), run_id, event, to_json(&data)?).await
    }

    /// Stops both workers, letting in-flight invocations finish.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            worker.shutdown().await;
        }
        info!(workflow.id = %self.id, "workflow shut down");
    }

    fn handle(&self, run_id: &str) -> RunHandle<R> {
        RunHandle {
            workflow_id: self.id.clone(),
            run_id: run_id.to_string(),
            primary: Arc::clone(&self.primary),
            store: Arc::clone(&self.store),
            _result: PhantomData,
        }
    }
}

/// Handle on one run of a workflow.
pub struct RunHandle<R> {
    workflow_id: String,
    run_id: String,
    primary: Arc<dyn JobQueue>,
    store: Arc<dyn StepStore>,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> RunHandle<R> {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Waits until the run's job completed or failed for good.
    pub async fn wait_until_finished(&self) -> Result<Finished> {
        Ok(self.primary.wait_until_finished(&self.run_id).await?)
    }

    /// Waits for the run and decodes its result.
    pub async fn get_result(&self) -> Result<RunResult<R>> {
        Ok(match self.wait_until_finished().await? {
            Finished::Completed(value) => RunResult::Success {
                result: from_json(value)?,
            },
            Finished::Failed(failure) => RunResult::Failure {
                failed_reason: failure.failed_reason,
                stacktrace: failure.stacktrace,
            },
        })
    }

    /// Current state of the run's job.
    pub async fn state(&self) -> Result<JobState> {
        self.primary
            .get_job(&self.run_id)
            .await?
            .map(|job| job.state)
            .ok_or_else(|| WorkflowError::RunNotFound {
                workflow_id: self.workflow_id.clone(),
                run_id: self.run_id.clone(),
            })
    }

    /// Every recorded attempt of `step_id`, in attempt order.
    pub async fn get_step_attempts(&self, step_id: &str) -> Result<Vec<StepOutcome>> {
        let cache = StepCache::load(Arc::clone(&self.store), &self.workflow_id, &self.run_id).await?;
        Ok(cache.attempts(step_id)?)
    }

    /// The newest recorded attempt of `step_id`.
    pub async fn get_step_result(&self, step_id: &str) -> Result<Option<StepOutcome>> {
        let cache = StepCache::load(Arc::clone(&self.store), &self.workflow_id, &self.run_id).await?;
        Ok(cache.result(step_id)?)
    }
}
