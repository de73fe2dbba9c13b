use serde::Deserialize;
use std::time::Duration;

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

const DEFAULT_EVENT_TIMEOUT_MS: u64 = 365 * 24 * 3600 * 1000;

/// Runtime settings for a workflow.
///
/// Deserializable so it can live in an application's config file; any field
/// left out takes its default.
///
/// ```
/// use ponos::executor::WorkflowConfig;
/// use std::time::Duration;
///
/// let config: WorkflowConfig = serde_json::from_str(r#"{ "concurrency": 4 }"#).unwrap();
/// assert_eq!(config.concurrency, 4);
/// assert_eq!(config.poll_interval(), Duration::from_millis(250));
///
/// let config = WorkflowConfig::default().with_events_queue_suffix("-signals");
/// assert_eq!(config.events_queue_suffix, "-signals");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Maximum invocations a worker runs at once.
    pub concurrency: usize,
    /// Upper bound on how long an idle worker sleeps between checks.
    pub poll_interval_ms: u64,
    /// Timeout of `wait_for_event` when the caller gives none.
    pub default_event_timeout_ms: u64,
    /// Appended to the workflow id to name the companion events queue.
    pub events_queue_suffix: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            poll_interval_ms: 250,
            default_event_timeout_ms: DEFAULT_EVENT_TIMEOUT_MS,
            events_queue_suffix: "-events".to_string(),
        }
    }
}

impl WorkflowConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Rounded down to whole milliseconds.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = whole_millis(interval);
        self
    }

    /// Rounded down to whole milliseconds; too long a timeout saturates.
    pub fn with_default_event_timeout(mut self, timeout: Duration) -> Self {
        self.default_event_timeout_ms = whole_millis(timeout);
        self
    }

    pub fn with_events_queue_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.events_queue_suffix = suffix.into();
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_event_timeout(&self) -> Duration {
        Duration::from_millis(self.default_event_timeout_ms)
    }

    /// Name of the companion queue for `workflow_id`.
    pub fn events_queue_name(&self, workflow_id: &str) -> String {
        format!("{}{}", workflow_id, self.events_queue_suffix)
    }
}
