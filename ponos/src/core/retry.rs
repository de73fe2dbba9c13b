// =============================================================================
// STEP RETRY BEHAVIOR
// =============================================================================
//
// Every attempt of a step is recorded, failures included. A retry is simply
// the next attempt number for the same step id, so replaying an invocation
// walks the recorded attempts in order and only runs the body for the first
// attempt with no record.
//
// The policy decides HOW MANY attempts a step gets and how long to wait
// between them inside one invocation. Which errors are retried is decided by
// the executor: everything except the `Unrecoverable` marker.
// =============================================================================

use std::time::Duration;

/// Configuration for step retry behavior.
///
/// # Examples
///
/// ```
/// use ponos::core::RetryPolicy;
/// use std::time::Duration;
///
/// // Retry right away, up to 3 attempts in total.
/// let quick = RetryPolicy::immediate(3);
/// assert_eq!(quick.delay_for_attempt(1), Some(Duration::ZERO));
///
/// // Custom policy with exponential backoff.
/// const API_RETRY: RetryPolicy = RetryPolicy {
///     max_attempts: 5,
///     initial_delay: Duration::from_millis(200),
///     max_delay: Duration::from_secs(5),
///     backoff_multiplier: 2.0,
/// };
/// assert_eq!(API_RETRY.delay_for_attempt(2), Some(Duration::from_millis(400)));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    ///
    /// Default: 1 (no retries)
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (caps exponential backoff).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff.
    ///
    /// Each retry delay is calculated as:
    /// `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// No retries - the first failure is final.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_delay: Duration::from_secs(0),
        max_delay: Duration::from_secs(0),
        backoff_multiplier: 1.0,
    };

    /// Standard retry policy with backoff.
    ///
    /// Retry schedule: immediate → 1s → 2s
    pub const STANDARD: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// Up to `max_attempts` attempts with no delay between them.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(0),
            max_delay: Duration::from_secs(0),
            backoff_multiplier: 1.0,
        }
    }

    /// Up to `max_attempts` attempts using the standard delays.
    pub const fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate the delay before the next retry attempt.
    ///
    /// `attempt` is the attempt that just failed (1-indexed). Returns `None`
    /// when no attempts remain.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }

        let exponent = (attempt - 1) as f64;
        let multiplier = self.backoff_multiplier.powf(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        Some(Duration::from_secs_f64(
            delay_secs.min(self.max_delay.as_secs_f64()),
        ))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u32> for RetryPolicy {
    /// `n.into()` retries immediately, up to `n` attempts.
    fn from(max_attempts: u32) -> Self {
        Self::immediate(max_attempts)
    }
}
