//! Task types: errors, options, handles and onError outcomes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trellis_config::RetryPolicy;

use crate::error::RunError;

/// Error raised by a task body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
  /// Generic failure.
  #[error("{message}")]
  Failed { message: String, retryable: bool },

  /// A provider API call failed.
  #[error("{provider} error: {message}")]
  Provider {
    provider: String,
    status: Option<u16>,
    message: String,
    retryable: bool,
  },

  /// A provider rejected the call until `reset_at`.
  #[error("rate limited until {reset_at}: {message}")]
  RateLimited {
    reset_at: DateTime<Utc>,
    message: String,
  },

  /// A nested task failed.
  #[error("subtask '{key}' failed: {message}")]
  Subtask {
    key: String,
    message: String,
    retryable: bool,
  },
}

impl TaskError {
  /// Retryable failure.
  pub fn new(message: impl Into<String>) -> Self {
    Self::Failed {
      message: message.into(),
      retryable: true,
    }
  }

  /// Failure that is never retried.
  pub fn fatal(message: impl Into<String>) -> Self {
    Self::Failed {
      message: message.into(),
      retryable: false,
    }
  }

  /// Provider failure. Client errors (4xx other than 408 and 429) are not
  /// retried; everything else is.
  pub fn provider(provider: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
    let retryable = match status {
      Some(408) | Some(429) => true,
      Some(code) => !(400..500).contains(&code),
      None => true,
    };
    Self::Provider {
      provider: provider.into(),
      status,
      message: message.into(),
      retryable,
    }
  }

  pub fn rate_limited(reset_at: DateTime<Utc>, message: impl Into<String>) -> Self {
    Self::RateLimited {
      reset_at,
      message: message.into(),
    }
  }

  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Failed { retryable, .. }
      | Self::Provider { retryable, .. }
      | Self::Subtask { retryable, .. } => *retryable,
      Self::RateLimited { .. } => true,
    }
  }

  /// Earliest time the error allows a retry, if it dictates one.
  pub fn retry_at(&self) -> Option<DateTime<Utc>> {
    match self {
      Self::RateLimited { reset_at, .. } => Some(*reset_at),
      _ => None,
    }
  }
}

impl From<RunError> for TaskError {
  fn from(err: RunError) -> Self {
    match err {
      RunError::TaskFailed { key, error, .. } => Self::Subtask {
        key,
        message: error.to_string(),
        retryable: false,
      },
      RunError::Store(e) => Self::new(e.to_string()),
      other => Self::fatal(other.to_string()),
    }
  }
}

/// A labelled value shown next to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayProperty {
  pub label: String,
  pub text: String,
}

impl DisplayProperty {
  pub fn new(label: impl Into<String>, text: impl Into<String>) -> Self {
    Self {
      label: label.into(),
      text: text.into(),
    }
  }
}

/// Result of an onError handler.
#[derive(Debug, Clone, PartialEq)]
pub enum OnErrorOutcome {
  /// Keep the original error.
  Unhandled,
  /// Propagate this error instead.
  Replace(TaskError),
  /// Retry no earlier than `retry_at`.
  RetryAt {
    retry_at: DateTime<Utc>,
    error: TaskError,
  },
}

pub type OnErrorFn = Arc<dyn Fn(&TaskError, &TaskHandle) -> OnErrorOutcome + Send + Sync>;

/// Options for a task invocation.
#[derive(Clone, Default)]
pub struct TaskOptions {
  /// Display name. Defaults to the task key.
  pub name: Option<String>,
  pub params: serde_json::Value,
  pub icon: Option<String>,
  pub properties: Vec<DisplayProperty>,
  /// Retry policy. Defaults to no retries.
  pub retry: Option<RetryPolicy>,
  pub on_error: Option<OnErrorFn>,
}

impl TaskOptions {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: Some(name.into()),
      ..Self::default()
    }
  }

  pub fn with_params(mut self, params: serde_json::Value) -> Self {
    self.params = params;
    self
  }

  pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
    self.icon = Some(icon.into());
    self
  }

  pub fn with_property(mut self, label: impl Into<String>, text: impl Into<String>) -> Self {
    self.properties.push(DisplayProperty::new(label, text));
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }

  pub fn with_on_error<F>(mut self, on_error: F) -> Self
  where
    F: Fn(&TaskError, &TaskHandle) -> OnErrorOutcome + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(on_error));
    self
  }

  pub(crate) fn display(&self) -> serde_json::Value {
    serde_json::json!({
      "icon": self.icon,
      "properties": self.properties,
    })
  }
}

impl fmt::Debug for TaskOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskOptions")
      .field("name", &self.name)
      .field("params", &self.params)
      .field("icon", &self.icon)
      .field("properties", &self.properties)
      .field("retry", &self.retry)
      .field("on_error", &self.on_error.is_some())
      .finish()
  }
}

/// The task currently executing, passed to its body and onError handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
  pub run_id: String,
  /// Full key, namespaced under parent keys.
  pub key: String,
  pub parent_key: Option<String>,
  pub name: String,
  /// 1-based attempt number.
  pub attempt: u32,
  /// 1 for a top-level task.
  pub depth: u32,
  pub params: serde_json::Value,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_provider_retryability() {
    assert!(TaskError::provider("resend", Some(503), "unavailable").is_retryable());
    assert!(TaskError::provider("resend", Some(429), "slow down").is_retryable());
    assert!(!TaskError::provider("resend", Some(422), "bad address").is_retryable());
    assert!(TaskError::provider("resend", None, "connection reset").is_retryable());
  }

  #[test]
  fn test_serde_tagging() {
    let err = TaskError::fatal("boom");
    let value = serde_json::to_value(&err).unwrap();
    assert_eq!(value["kind"], "failed");
    assert_eq!(serde_json::from_value::<TaskError>(value).unwrap(), err);
  }

  #[test]
  fn test_from_run_error() {
    let nested = RunError::TaskFailed {
      key: "a/b".to_string(),
      attempts: 2,
      error: TaskError::new("flaky"),
    };
    let err = TaskError::from(nested);
    assert!(matches!(err, TaskError::Subtask { ref key, .. } if key == "a/b"));
    assert!(!err.is_retryable());

    let limit = RunError::NestingLimit {
      key: "k".to_string(),
      depth: 6,
      max: 5,
    };
    assert!(!TaskError::from(limit).is_retryable());
  }
}
