use super::{
    error::QueueError, error::Result, Finished, Job, JobFailure, JobQueue, JobState, LockedJob,
    NewJob, ParentRef, QueueBroker,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Job plus the bookkeeping only the broker sees.
struct JobEntry {
    job: Job,
    /// FIFO position among waiting jobs; refreshed whenever the job is requeued.
    seq: u64,
    token: Option<Uuid>,
    /// `(queue, id)` of children that have not finished yet.
    pending_children: HashSet<(String, String)>,
}

struct QueueState {
    name: String,
    jobs: DashMap<String, JobEntry>,
    seq: AtomicU64,
    /// Wakes workers when a job may have become ready.
    work_notify: Arc<Notify>,
    /// Wakes `wait_until_finished` callers when any job finishes.
    status_notify: Arc<Notify>,
}

impl QueueState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            jobs: DashMap::new(),
            seq: AtomicU64::new(0),
            work_notify: Arc::new(Notify::new()),
            status_notify: Arc::new(Notify::new()),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

type Registry = DashMap<String, Arc<QueueState>>;

/// In-process job-queue substrate.
///
/// Queues are created on first use and live as long as the broker. Parent and
/// child jobs may live in different queues of the same broker. Suitable for
/// tests and single-process deployments; nothing is persisted.
///
/// # Example
///
/// ```
/// use ponos::queue::{InMemoryBroker, JobQueue, NewJob, QueueBroker};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let queue = broker.queue("orders");
/// queue.add(NewJob::new("order-1", "orders", json!({ "total": 3 }))).await?;
///
/// let locked = queue.next_job().await?.expect("job is ready");
/// queue.complete(&locked.job.id, locked.token, json!("ok")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    queues: Arc<Registry>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, name: &str) -> Arc<QueueState> {
        let entry = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new(name)));
        Arc::clone(entry.value())
    }
}

impl QueueBroker for InMemoryBroker {
    fn queue(&self, name: &str) -> Arc<dyn JobQueue> {
        Arc::new(InMemoryQueue {
            state: self.state(name),
            registry: Arc::clone(&self.queues),
        })
    }
}

/// Handle on one queue of an [`InMemoryBroker`].
pub struct InMemoryQueue {
    state: Arc<QueueState>,
    registry: Arc<Registry>,
}

impl InMemoryQueue {
    fn not_found(&self, id: &str) -> QueueError {
        QueueError::NotFound {
            queue: self.state.name.clone(),
            id: id.to_string(),
        }
    }

    fn lookup(&self, queue: &str) -> Option<Arc<QueueState>> {
        self.registry.get(queue).map(|q| Arc::clone(q.value()))
    }

    /// Returns the entry if `token` holds the job's current lock.
    fn claimed(&self, id: &str, token: Uuid) -> Result<RefMut<'_, String, JobEntry>> {
        let entry = self
            .state
            .jobs
            .get_mut(id)
            .ok_or_else(|| self.not_found(id))?;
        if entry.job.state != JobState::Active || entry.token != Some(token) {
            return Err(QueueError::LockMismatch {
                queue: self.state.name.clone(),
                id: id.to_string(),
            });
        }
        Ok(entry)
    }

    fn requeue(&self, entry: &mut JobEntry) {
        entry.job.state = JobState::Waiting;
        entry.job.ready_at = None;
        entry.token = None;
        entry.seq = self.state.next_seq();
    }

    /// Drops `child_id` from the parent's pending set and wakes the parent
    /// when it was the last one.
    fn release_parent(&self, parent: &ParentRef, child_id: &str) {
        let Some(parent_queue) = self.lookup(&parent.queue) else {
            return;
        };
        let woke = match parent_queue.jobs.get_mut(&parent.id) {
            Some(mut entry) => {
                entry
                    .pending_children
                    .remove(&(self.state.name.clone(), child_id.to_string()));
                if entry.pending_children.is_empty()
                    && entry.job.state == JobState::WaitingChildren
                {
                    entry.job.state = JobState::Waiting;
                    entry.seq = parent_queue.next_seq();
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if woke {
            debug!(queue = %parent.queue, job = %parent.id, "children finished, parent is ready");
            parent_queue.work_notify.notify_one();
        }
    }

    fn finish(&self, id: &str, parent: Option<ParentRef>) {
        self.state.status_notify.notify_waiters();
        if let Some(parent) = parent {
            self.release_parent(&parent, id);
        }
    }
}

/// `now + delay`, saturating at the latest representable time.
fn ready_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn add(&self, new: NewJob) -> Result<Job> {
        if self.state.jobs.contains_key(&new.id) {
            return Err(QueueError::DuplicateJob {
                queue: self.state.name.clone(),
                id: new.id,
            });
        }

        let now = Utc::now();
        let ready_at = match new.delay {
            Some(delay) if !delay.is_zero() => Some(ready_after(now, delay)),
            _ => None,
        };

        // Link to the parent before the child exists, so the child can never
        // finish unnoticed.
        let link = (self.state.name.clone(), new.id.clone());
        if let Some(parent) = &new.parent {
            let parent_missing = || QueueError::ParentNotFound {
                queue: parent.queue.clone(),
                id: parent.id.clone(),
            };
            let parent_queue = self.lookup(&parent.queue).ok_or_else(parent_missing)?;
            let mut entry = parent_queue
                .jobs
                .get_mut(&parent.id)
                .ok_or_else(parent_missing)?;
            entry.pending_children.insert(link.clone());
        }

        let job = Job {
            id: new.id.clone(),
            name: new.name,
            data: new.data,
            state: if ready_at.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            parent: new.parent,
            attempts: new.attempts.max(1),
            attempts_made: 0,
            ready_at,
            return_value: None,
            failure: None,
            created_at: now,
            finished_at: None,
        };

        let inserted = match self.state.jobs.entry(new.id.clone()) {
            Entry::Occupied(existing) => Err(existing.get().job.parent.clone()),
            Entry::Vacant(slot) => {
                slot.insert(JobEntry {
                    job: job.clone(),
                    seq: self.state.next_seq(),
                    token: None,
                    pending_children: HashSet::new(),
                });
                Ok(())
            }
        };

        if let Err(existing_parent) = inserted {
            // Lost a race with another add of the same id; undo our link
            // unless the winner reports to the same parent.
            if let Some(parent) = &job.parent {
                if existing_parent.as_ref() != Some(parent) {
                    if let Some(parent_queue) = self.lookup(&parent.queue) {
                        if let Some(mut entry) = parent_queue.jobs.get_mut(&parent.id) {
                            entry.pending_children.remove(&link);
                        }
                    }
                }
            }
            return Err(QueueError::DuplicateJob {
                queue: self.state.name.clone(),
                id: new.id,
            });
        }

        debug!(queue = %self.state.name, job = %job.id, state = %job.state, "job added");
        self.state.work_notify.notify_one();
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.state.jobs.get(id).map(|entry| entry.job.clone()))
    }

    async fn update_data(&self, id: &str, data: Value) -> Result<()> {
        let mut entry = self
            .state
            .jobs
            .get_mut(id)
            .ok_or_else(|| self.not_found(id))?;
        if entry.job.state.is_finished() {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                state: entry.job.state,
                operation: "update data of",
            });
        }
        entry.job.data = data;
        Ok(())
    }

    async fn change_delay(&self, id: &str, delay: Duration) -> Result<()> {
        let ready_at = ready_after(Utc::now(), delay);
        {
            let mut entry = self
                .state
                .jobs
                .get_mut(id)
                .ok_or_else(|| self.not_found(id))?;
            if entry.job.state != JobState::Delayed {
                return Err(QueueError::InvalidState {
                    id: id.to_string(),
                    state: entry.job.state,
                    operation: "change delay of",
                });
            }
            entry.job.ready_at = Some(ready_at);
        }
        self.state.work_notify.notify_one();
        Ok(())
    }

    async fn next_job(&self) -> Result<Option<LockedJob>> {
        let now = Utc::now();

        // Collect first: mutating while iterating a DashMap deadlocks.
        let mut candidates: Vec<(u64, String)> = Vec::new();
        let mut due: Vec<String> = Vec::new();
        for entry in self.state.jobs.iter() {
            match entry.job.state {
                JobState::Waiting => candidates.push((entry.seq, entry.key().clone())),
                JobState::Delayed if entry.job.ready_at.is_none_or(|at| at <= now) => {
                    due.push(entry.key().clone())
                }
                _ => {}
            }
        }

        for id in due {
            if let Some(mut entry) = self.state.jobs.get_mut(&id) {
                let ready = entry.job.ready_at.is_none_or(|at| at <= now);
                if entry.job.state == JobState::Delayed && ready {
                    self.requeue(&mut entry);
                    candidates.push((entry.seq, id.clone()));
                }
            }
        }

        candidates.sort();
        for (_, id) in candidates {
            if let Some(mut entry) = self.state.jobs.get_mut(&id) {
                if entry.job.state == JobState::Waiting {
                    let token = Uuid::new_v4();
                    entry.job.state = JobState::Active;
                    entry.token = Some(token);
                    return Ok(Some(LockedJob {
                        job: entry.job.clone(),
                        token,
                    }));
                }
            }
        }

        Ok(None)
    }

    async fn move_to_delayed(&self, id: &str, token: Uuid, until: DateTime<Utc>) -> Result<()> {
        {
            let mut entry = self.claimed(id, token)?;
            entry.job.state = JobState::Delayed;
            entry.job.ready_at = Some(until);
            entry.token = None;
        }
        self.state.work_notify.notify_one();
        Ok(())
    }

    async fn move_to_waiting_children(&self, id: &str, token: Uuid) -> Result<bool> {
        let parked = {
            let mut entry = self.claimed(id, token)?;
            if entry.pending_children.is_empty() {
                self.requeue(&mut entry);
                false
            } else {
                entry.job.state = JobState::WaitingChildren;
                entry.token = None;
                true
            }
        };
        if !parked {
            self.state.work_notify.notify_one();
        }
        Ok(parked)
    }

    async fn complete(&self, id: &str, token: Uuid, value: Value) -> Result<()> {
        let parent = {
            let mut entry = self.claimed(id, token)?;
            entry.job.state = JobState::Completed;
            entry.job.return_value = Some(value);
            entry.job.finished_at = Some(Utc::now());
            entry.token = None;
            entry.job.parent.clone()
        };
        self.finish(id, parent);
        Ok(())
    }

    async fn fail(
        &self,
        id: &str,
        token: Uuid,
        failure: JobFailure,
        unrecoverable: bool,
    ) -> Result<JobState> {
        let (state, parent) = {
            let mut entry = self.claimed(id, token)?;
            entry.job.attempts_made += 1;
            entry.job.failure = Some(failure);
            if !unrecoverable && entry.job.attempts_made < entry.job.attempts {
                self.requeue(&mut entry);
            } else {
                entry.job.state = JobState::Failed;
                entry.job.finished_at = Some(Utc::now());
                entry.token = None;
            }
            (entry.job.state, entry.job.parent.clone())
        };

        if state == JobState::Failed {
            self.finish(id, parent);
        } else {
            self.state.work_notify.notify_one();
        }
        Ok(state)
    }

    async fn wait_until_finished(&self, id: &str) -> Result<Finished> {
        loop {
            // Register interest before checking, so a finish between the check
            // and the await is not missed.
            let notified = self.state.status_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let finished = match self.state.jobs.get(id) {
                Some(entry) => entry.job.finished(),
                None => return Err(self.not_found(id)),
            };
            if let Some(finished) = finished {
                return Ok(finished);
            }

            notified.await;
        }
    }

    async fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .jobs
            .iter()
            .filter(|entry| entry.job.state == JobState::Delayed)
            .filter_map(|entry| entry.job.ready_at)
            .min()
    }

    fn work_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.state.work_notify)
    }
}
