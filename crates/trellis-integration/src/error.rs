use trellis_runtime::RunError;

/// Error type for integration setup and invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntegrationError {
  #[error("integration id is required")]
  MissingId,

  #[error("integration '{id}' requires a client or a client factory")]
  MissingClient { id: String },

  #[error("integration '{id}' was given both a client and a client factory")]
  ConflictingClient { id: String },

  #[error("integration '{id}' defines task '{task}' more than once")]
  DuplicateTask { id: String, task: String },

  #[error("integration '{id}' has no task named '{task}'")]
  UnknownTask { id: String, task: String },

  #[error("integration '{id}' has no connection for this run")]
  MissingCredentials { id: String },

  #[error("failed to create client for integration '{id}': {message}")]
  ClientFactory { id: String, message: String },
}

impl From<IntegrationError> for RunError {
  fn from(err: IntegrationError) -> Self {
    RunError::Configuration {
      message: err.to_string(),
    }
  }
}
