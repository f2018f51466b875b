//! Runtime errors.

use crate::task::TaskError;

/// Errors that can occur while executing a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
  /// Execution was cancelled.
  #[error("execution cancelled")]
  Cancelled,

  /// The payload failed the trigger schema. No run was created.
  #[error("payload validation failed: {message}")]
  Validation { message: String },

  /// The job or integration is misconfigured for this call.
  #[error("configuration error: {message}")]
  Configuration { message: String },

  /// A task was invoked deeper than the nesting limit.
  #[error("task '{key}' at depth {depth} exceeds the maximum nesting depth of {max}")]
  NestingLimit { key: String, depth: u32, max: u32 },

  /// A task with the same key is already active in this run.
  #[error("task key '{key}' is already active in this run")]
  DuplicateTaskKey { key: String },

  /// A task failed and will not be retried.
  #[error("task '{key}' failed after {attempts} attempt(s): {error}")]
  TaskFailed {
    key: String,
    attempts: u32,
    #[source]
    error: TaskError,
  },

  /// Reading or writing run state failed.
  #[error("store error: {0}")]
  Store(#[from] trellis_store::Error),

  /// A task output or the run context could not be (de)serialized.
  #[error("serialization failed for '{key}': {message}")]
  Serialization { key: String, message: String },

  /// The run function failed.
  #[error("{message}")]
  Failed { message: String },
}

impl RunError {
  /// Fail the run with a message.
  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed {
      message: message.into(),
    }
  }
}
