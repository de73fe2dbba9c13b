use thiserror::Error;

/// Core error type for the ponos workflow engine.
///
/// Keeps the `serde_json` error as `#[source]` so the chain survives up to
/// the runtime's error messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Encoding a value to JSON failed.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Decoding a JSON value failed.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),

    /// A cache field did not have the `<stepId>:<attempt>` shape.
    #[error("malformed step key: {0}")]
    MalformedStepKey(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
