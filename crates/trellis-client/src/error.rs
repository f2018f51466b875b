use trellis_runtime::{JobError, JobKey, RunError};

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  #[error("invalid job: {0}")]
  Configuration(#[from] JobError),

  #[error("job {0} is already registered")]
  AlreadyRegistered(JobKey),

  #[error("job not found: {0}")]
  JobNotFound(String),

  #[error("run not found: {0}")]
  RunNotFound(String),

  #[error("run {0} is already executing")]
  RunInProgress(String),

  #[error("run queue closed")]
  QueueClosed,

  #[error(transparent)]
  Run(#[from] RunError),

  #[error("store error: {0}")]
  Store(#[from] trellis_store::Error),

  #[error("client loop is already running")]
  AlreadyStarted,
}
