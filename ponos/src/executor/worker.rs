//! Queue workers.
//!
//! A [`Worker`] claims jobs from one [`JobQueue`], hands each to a
//! [`JobProcessor`] on its own task and applies the returned
//! [`JobDisposition`] back to the queue. Concurrency is bounded by a
//! semaphore; shutdown goes through a `CancellationToken` and waits for
//! in-flight jobs to finish.

use crate::queue::{JobFailure, JobQueue, LockedJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What to do with a claimed job once it has been processed.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposition {
    /// Complete the job with a return value.
    Complete(Value),
    /// Fail the job; `unrecoverable` skips the job's remaining attempts.
    Fail {
        failure: JobFailure,
        unrecoverable: bool,
    },
    /// Keep the job delayed until the given time.
    Delay(DateTime<Utc>),
    /// Park the job until its children have finished.
    WaitForChildren,
}

impl JobDisposition {
    pub fn fail(failure: JobFailure, unrecoverable: bool) -> Self {
        JobDisposition::Fail {
            failure,
            unrecoverable,
        }
    }
}

/// Processes jobs claimed from a queue.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: &LockedJob) -> JobDisposition;
}

/// Applies `disposition` to the claimed job.
async fn settle(
    queue: &dyn JobQueue,
    locked: &LockedJob,
    disposition: JobDisposition,
) -> crate::queue::Result<()> {
    let id = locked.job.id.as_str();
    match disposition {
        JobDisposition::Complete(value) => queue.complete(id, locked.token, value).await,
        JobDisposition::Fail {
            failure,
            unrecoverable,
        } => {
            let state = queue.fail(id, locked.token, failure, unrecoverable).await?;
            debug!(job.id = %id, %state, "job failed");
            Ok(())
        }
        JobDisposition::Delay(until) => queue.move_to_delayed(id, locked.token, until).await,
        JobDisposition::WaitForChildren => {
            if !queue.move_to_waiting_children(id, locked.token).await? {
                debug!(job.id = %id, "children already finished, job requeued");
            }
            Ok(())
        }
    }
}

/// Claims jobs from a queue and runs them through a processor.
pub struct Worker<P: JobProcessor> {
    worker_id: String,
    queue: Arc<dyn JobQueue>,
    processor: Arc<P>,
    max_concurrent_jobs: usize,
    poll_interval: Duration,
}

impl<P: JobProcessor> Worker<P> {
    pub fn new(worker_id: impl Into<String>, queue: Arc<dyn JobQueue>, processor: P) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            processor: Arc::new(processor),
            max_concurrent_jobs: 16,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Upper bound on how long the worker idles before checking the queue
    /// again. Workers are woken early whenever a job may have become ready.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// How long to idle: until the next delayed job is due, capped by the
    /// poll interval.
    async fn idle_timeout(&self) -> Duration {
        match self.queue.next_ready_at().await {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval),
            None => self.poll_interval,
        }
    }

    /// Starts the worker in the background.
    pub fn start(self) -> WorkerHandle {
        let cancellation_token = CancellationToken::new();
        let worker_token = cancellation_token.clone();
        let worker_id = self.worker_id.clone();

        info!(worker.id = %self.worker_id, queue = %self.queue.name(), "starting worker");

        let handle = tokio::spawn(async move {
            let mut active_jobs: JoinSet<()> = JoinSet::new();
            let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));
            let work_notify = self.queue.work_notify();

            loop {
                while let Some(result) = active_jobs.try_join_next() {
                    if let Err(e) = result {
                        error!(worker.id = %self.worker_id, error = %e, "job task failed");
                    }
                }

                let permit = tokio::select! {
                    biased;
                    _ = worker_token.cancelled() => {
                        info!(worker.id = %self.worker_id, "received shutdown signal");
                        break;
                    }
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            error!(worker.id = %self.worker_id, "semaphore closed unexpectedly");
                            break;
                        }
                    },
                };

                match self.queue.next_job().await {
                    Ok(Some(locked)) => {
                        let queue = Arc::clone(&self.queue);
                        let processor = Arc::clone(&self.processor);
                        let span = info_span!(
                            "job",
                            worker.id = %self.worker_id,
                            queue = %queue.name(),
                            job.id = %locked.job.id
                        );
                        active_jobs.spawn(
                            async move {
                                let _permit = permit;
                                let disposition = processor.process(&locked).await;
                                if let Err(e) = settle(queue.as_ref(), &locked, disposition).await {
                                    error!(error = %e, "failed to settle job");
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Ok(None) => {
                        drop(permit);
                        let timeout = self.idle_timeout().await;
                        tokio::select! {
                            _ = worker_token.cancelled() => {}
                            _ = tokio::time::timeout(timeout, work_notify.notified()) => {}
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        warn!(worker.id = %self.worker_id, error = %e, "failed to claim job");
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }

            let in_flight = active_jobs.len();
            if in_flight > 0 {
                info!(worker.id = %self.worker_id, in_flight, "waiting for in-flight jobs");
                while active_jobs.join_next().await.is_some() {}
            }
            info!(worker.id = %self.worker_id, "worker stopped");
        });

        WorkerHandle {
            worker_id,
            handle,
            cancellation_token,
        }
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    worker_id: String,
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stops claiming jobs and waits for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.handle.await;
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Aborts the worker without waiting for in-flight jobs.
    pub fn abort(&self) {
        self.handle.abort();
    }
}
