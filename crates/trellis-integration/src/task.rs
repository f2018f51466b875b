use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use trellis_config::RetryPolicy;
use trellis_runtime::{Credentials, DisplayProperty, Io, OnErrorOutcome, TaskError, TaskHandle};

/// Display metadata and retry policy derived from a task's params.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInit {
  pub name: String,
  /// Params recorded with the task and handed to `run`.
  pub params: Value,
  pub icon: Option<String>,
  pub properties: Vec<DisplayProperty>,
  /// Defaults to [`RetryPolicy::standard`].
  pub retry: Option<RetryPolicy>,
}

impl TaskInit {
  pub fn new(name: impl Into<String>, params: Value) -> Self {
    Self {
      name: name.into(),
      params,
      icon: None,
      properties: Vec::new(),
      retry: None,
    }
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
}

/// An operation of an integration, bound to its client.
#[async_trait]
pub trait AuthenticatedTask<C>: Send + Sync {
  /// Derive display metadata from params. Must not perform I/O.
  fn init(&self, params: &Value) -> TaskInit;

  /// Perform the call. `io` is scoped to this task, so nested tasks are
  /// namespaced under it. `auth` is set for delegated-auth integrations.
  async fn run(
    &self,
    params: Value,
    client: Arc<C>,
    task: TaskHandle,
    io: Io,
    auth: Option<Credentials>,
  ) -> Result<Value, TaskError>;

  /// Reclassify an error or request a retry time. The integration's shared
  /// handler runs when this one leaves the error unhandled.
  fn on_error(&self, _error: &TaskError, _task: &TaskHandle) -> OnErrorOutcome {
    OnErrorOutcome::Unhandled
  }
}
