//! Tagged success/failure values.
//!
//! Every step attempt is recorded as an [`Outcome`], and handlers can combine
//! several outcomes with [`Outcome::all`] without stopping at the first
//! failure.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a step attempt: `Success { value }` or `Failure { error }`.
///
/// Serialized with a `_tag` discriminator:
///
/// ```
/// use ponos::core::Outcome;
///
/// let ok: Outcome<String, u32> = Outcome::succeed(1);
/// assert_eq!(
///     serde_json::to_string(&ok).unwrap(),
///     r#"{"_tag":"Success","value":1}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Outcome<E, A> {
    Success { value: A },
    Failure { error: E },
}

impl<E, A> Outcome<E, A> {
    /// Wraps a value as a success.
    pub fn succeed(value: A) -> Self {
        Outcome::Success { value }
    }

    /// Wraps an error as a failure.
    pub fn fail(error: E) -> Self {
        Outcome::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure { .. })
    }

    /// Returns the success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Outcome::Success { value } => Some(value),
            Outcome::Failure { .. } => None,
        }
    }

    /// Returns the failure, if any.
    pub fn error(&self) -> Option<&E> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { error } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<A, E> {
        match self {
            Outcome::Success { value } => Ok(value),
            Outcome::Failure { error } => Err(error),
        }
    }

    /// Combines outcomes without short-circuiting.
    ///
    /// Every element is visited. The result is a failure carrying every error
    /// when at least one element failed, otherwise a success carrying every
    /// value. Order is preserved within each side.
    ///
    /// ```
    /// use ponos::core::Outcome;
    ///
    /// let mixed = vec![Outcome::succeed(1), Outcome::fail("e"), Outcome::succeed(2)];
    /// assert_eq!(Outcome::all(mixed), Outcome::fail(vec!["e"]));
    ///
    /// let ok: Vec<Outcome<&str, i32>> = vec![Outcome::succeed(1), Outcome::succeed(2)];
    /// assert_eq!(Outcome::all(ok), Outcome::succeed(vec![1, 2]));
    /// ```
    pub fn all<I>(results: I) -> Outcome<Vec<E>, Vec<A>>
    where
        I: IntoIterator<Item = Outcome<E, A>>,
    {
        let mut failures = Vec::new();
        let mut successes = Vec::new();

        for result in results {
            match result {
                Outcome::Success { value } => successes.push(value),
                Outcome::Failure { error } => failures.push(error),
            }
        }

        if failures.is_empty() {
            Outcome::succeed(successes)
        } else {
            Outcome::fail(failures)
        }
    }
}

impl<E, A> From<Result<A, E>> for Outcome<E, A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Outcome::succeed(value),
            Err(error) => Outcome::fail(error),
        }
    }
}

/// The recorded shape of a failed step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// The error message (`Display` of the error).
    pub failed_reason: String,
    /// The error followed by its `source()` chain, one cause per line.
    #[serde(default)]
    pub stack: String,
}

impl Failure {
    pub fn new(failed_reason: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            failed_reason: failed_reason.into(),
            stack: stack.into(),
        }
    }

    /// Builds a failure record from any error, walking its source chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let failed_reason = error.to_string();
        let mut stack = format!("Error: {}", failed_reason);
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push_str(&format!("\n    caused by: {}", cause));
            source = cause.source();
        }
        Self {
            failed_reason,
            stack,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.failed_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_all_collects_every_failure() {
        let results = vec![
            Outcome::fail("first"),
            Outcome::succeed(1),
            Outcome::fail("second"),
        ];
        assert_eq!(Outcome::all(results), Outcome::fail(vec!["first", "second"]));
    }

    #[test]
    fn test_all_of_nothing_succeeds() {
        let results: Vec<Outcome<String, u8>> = vec![];
        assert_eq!(Outcome::all(results), Outcome::succeed(vec![]));
    }

    #[test]
    fn test_failure_json_shape() {
        let outcome: Outcome<Failure, serde_json::Value> =
            Outcome::fail(Failure::new("Oh no!", "Error: Oh no!"));
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "_tag": "Failure",
                "error": { "failedReason": "Oh no!", "stack": "Error: Oh no!" }
            })
        );
    }

    #[test]
    fn test_failure_from_error_walks_sources() {
        #[derive(Debug, thiserror::Error)]
        #[error("charge declined")]
        struct Declined(#[source] std::io::Error);

        let err = Declined(std::io::Error::new(std::io::ErrorKind::TimedOut, "gateway timeout"));
        let failure = Failure::from_error(&err);
        assert_eq!(failure.failed_reason, "charge declined");
        assert!(failure.stack.contains("caused by: gateway timeout"));
    }

    #[test]
    fn test_stack_defaults_when_missing() {
        let failure: Failure = serde_json::from_value(json!({ "failedReason": "x" })).unwrap();
        assert_eq!(failure.stack, "");
    }
}
