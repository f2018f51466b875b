use crate::types::TriggerState;

/// Error type for trigger operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TriggerError {
  #[error("invalid trigger configuration: {0}")]
  InvalidConfig(String),

  #[error("invalid cron expression '{expression}': {message}")]
  InvalidCron { expression: String, message: String },

  #[error("payload for '{trigger}' failed validation: {}", .violations.join("; "))]
  Validation {
    trigger: String,
    violations: Vec<String>,
  },

  #[error("trigger is {state:?}, expected {expected:?}")]
  InvalidState {
    state: TriggerState,
    expected: TriggerState,
  },

  #[error("sub-trigger not found: {0}")]
  NotFound(String),
}
