//! Durable sleep.
//!
//! A sleep never blocks a worker. The first time a handler reaches
//! `step.sleep(id, ..)` the run records a `done` marker for `id` and
//! suspends; the worker parks the run's job as delayed until the wake-up
//! time. When the job is redelivered the handler replays from the top, finds
//! the marker and carries on.

use super::context::Step;
use super::error::{StepError, Suspension};
use crate::storage::SuspensionRecord;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

/// `now + duration`, saturating at the latest representable time.
pub(crate) fn deadline(duration: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Step {
    /// Suspends the run for `duration`, once per run.
    ///
    /// Returns `Ok(())` on the invocation after the sleep elapsed. Before
    /// that it returns `StepError::Suspended`, which the handler should
    /// propagate with `?`.
    ///
    /// # Example
    /// ```ignore
    /// step.sleep("cool-off", Duration::from_secs(24 * 3600)).await?;
    /// ```
    pub async fn sleep(&self, id: &str, duration: Duration) -> Result<(), StepError> {
        let ctx = &self.ctx;
        if ctx.cache.marker(id)?.is_some() {
            debug!(sleep.id = %id, "sleep already elapsed");
            return Ok(());
        }

        ctx.ensure_runnable(id)?;

        let suspension = Suspension::Delayed {
            id: id.to_string(),
            until: deadline(duration),
        };
        ctx.try_suspend(suspension.clone())
            .map_err(StepError::Suspended)?;

        // The marker is written before suspending, so the redelivered
        // invocation passes straight through.
        if let Err(e) = ctx
            .cache
            .record_marker(id, &SuspensionRecord::Done { data: None })
            .await
        {
            ctx.clear_suspension(&suspension);
            return Err(e.into());
        }

        Err(StepError::Suspended(suspension))
    }
}
