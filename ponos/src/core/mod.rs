//! Core types and utilities for ponos workflows.
//!
//! # Result Algebra
//! - [`Outcome`]: tagged `Success { value }` / `Failure { error }` value
//! - [`Failure`]: the recorded shape of a failed step attempt
//!
//! # Serialization
//! - [`serialize_value`]: Convert Rust types to JSON text for storage
//! - [`deserialize_value`]: Convert JSON text back to Rust types
//!
//! # Error Handling
//! - [`CoreError`]: Core error type with proper error chains
//! - [`Result<T>`]: Type alias for Results using CoreError
//!
//! # Retry Behavior
//! - [`RetryPolicy`]: Number of attempts and backoff between them
//!
//! # Example
//!
//! ```
//! use ponos::core::{deserialize_value, serialize_value, Failure, Outcome};
//!
//! let outcome: Outcome<Failure, u32> = Outcome::succeed(7);
//! let text = serialize_value(&outcome).unwrap();
//! let back: Outcome<Failure, u32> = deserialize_value(&text).unwrap();
//! assert!(back.is_success());
//! ```

mod error;
mod outcome;
pub mod retry;
mod serialization;

pub use error::{CoreError, Result};
pub use outcome::{Failure, Outcome};
pub use retry::RetryPolicy;
pub use serialization::{deserialize_value, from_json, serialize_value, to_json};
