use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use trellis_config::{EventSpec, IntegrationMetadata, RetryPolicy};
use trellis_runtime::{
  Credentials, IntegrationRef, Io, OnErrorFn, OnErrorOutcome, RunContext, RunError, TaskError,
  TaskHandle, TaskOptions,
};

use crate::error::IntegrationError;
use crate::task::AuthenticatedTask;

/// Builds a client from per-run connection credentials.
pub type ClientFactory<C> = Arc<dyn Fn(&Credentials) -> Result<C, IntegrationError> + Send + Sync>;

/// Where an integration gets its client.
pub enum ClientSource<C> {
  /// A single pre-authenticated client shared by all runs.
  Local(Arc<C>),
  /// A client built for each run from its connection credentials.
  Factory(ClientFactory<C>),
}

/// A third-party API exposed as tasks.
pub struct Integration<C> {
  metadata: IntegrationMetadata,
  client: ClientSource<C>,
  tasks: BTreeMap<String, Arc<dyn AuthenticatedTask<C>>>,
  events: Vec<EventSpec>,
  on_error: Option<OnErrorFn>,
}

impl<C> Integration<C>
where
  C: Send + Sync + 'static,
{
  pub fn builder(id: impl Into<String>, name: impl Into<String>) -> IntegrationBuilder<C> {
    IntegrationBuilder {
      metadata: IntegrationMetadata {
        id: id.into(),
        name: name.into(),
      },
      client: None,
      factory: None,
      tasks: Vec::new(),
      events: Vec::new(),
      on_error: None,
    }
  }

  pub fn id(&self) -> &str {
    &self.metadata.id
  }

  /// Whether clients are built from per-run credentials.
  pub fn is_delegated(&self) -> bool {
    matches!(self.client, ClientSource::Factory(_))
  }

  pub fn task_names(&self) -> impl Iterator<Item = &str> {
    self.tasks.keys().map(String::as_str)
  }

  pub fn events(&self) -> &[EventSpec] {
    &self.events
  }

  /// Invoke the task named `task_name` under `key`.
  ///
  /// The task's own onError runs first; the integration's shared handler
  /// runs when the task leaves the error unhandled.
  pub async fn run_task(
    &self,
    io: &Io,
    key: &str,
    task_name: &str,
    params: Value,
  ) -> Result<Value, RunError> {
    let task = self
      .tasks
      .get(task_name)
      .cloned()
      .ok_or_else(|| IntegrationError::UnknownTask {
        id: self.metadata.id.clone(),
        task: task_name.to_string(),
      })?;
    let (client, auth) = self.resolve_client(io.context())?;

    let init = task.init(&params);
    debug!(
      integration = %self.metadata.id,
      task = task_name,
      key = key,
      "invoking integration task"
    );

    let on_error: OnErrorFn = {
      let task = Arc::clone(&task);
      let shared = self.on_error.clone();
      Arc::new(move |error: &TaskError, handle: &TaskHandle| {
        match task.on_error(error, handle) {
          OnErrorOutcome::Unhandled => shared
            .as_ref()
            .map_or(OnErrorOutcome::Unhandled, |shared| shared(error, handle)),
          outcome => outcome,
        }
      })
    };

    let options = TaskOptions {
      name: Some(init.name),
      params: init.params,
      icon: init.icon.or_else(|| Some(self.metadata.id.clone())),
      properties: init.properties,
      retry: Some(init.retry.unwrap_or_else(RetryPolicy::standard)),
      on_error: Some(on_error),
    };

    io.run_task(key, options, move |handle, scoped| {
      let task = Arc::clone(&task);
      let client = Arc::clone(&client);
      let auth = auth.clone();
      async move {
        let params = handle.params.clone();
        task.run(params, client, handle, scoped, auth).await
      }
    })
    .await
  }

  /// Like [`run_task`](Self::run_task), deserializing the output.
  pub async fn run_task_as<T: DeserializeOwned>(
    &self,
    io: &Io,
    key: &str,
    task_name: &str,
    params: Value,
  ) -> Result<T, RunError> {
    let output = self.run_task(io, key, task_name, params).await?;
    serde_json::from_value(output).map_err(|e| RunError::Serialization {
      key: key.to_string(),
      message: e.to_string(),
    })
  }

  fn resolve_client(
    &self,
    context: &RunContext,
  ) -> Result<(Arc<C>, Option<Credentials>), IntegrationError> {
    match &self.client {
      ClientSource::Local(client) => Ok((Arc::clone(client), None)),
      ClientSource::Factory(factory) => {
        let credentials = context.connection(&self.metadata.id).ok_or_else(|| {
          IntegrationError::MissingCredentials {
            id: self.metadata.id.clone(),
          }
        })?;
        let client = factory(credentials)?;
        Ok((Arc::new(client), Some(credentials.clone())))
      }
    }
  }
}

impl<C> IntegrationRef for Integration<C>
where
  C: Send + Sync + 'static,
{
  fn metadata(&self) -> &IntegrationMetadata {
    &self.metadata
  }

  fn event(&self, name: &str) -> Option<&EventSpec> {
    self.events.iter().find(|e| e.name == name)
  }
}

impl<C> fmt::Debug for Integration<C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mode = match self.client {
      ClientSource::Local(_) => "local",
      ClientSource::Factory(_) => "delegated",
    };
    f.debug_struct("Integration")
      .field("metadata", &self.metadata)
      .field("client", &mode)
      .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
      .field("events", &self.events)
      .finish()
  }
}

/// Builder for [`Integration`]. Exactly one of `client` and
/// `client_factory` must be set.
pub struct IntegrationBuilder<C> {
  metadata: IntegrationMetadata,
  client: Option<Arc<C>>,
  factory: Option<ClientFactory<C>>,
  tasks: Vec<(String, Arc<dyn AuthenticatedTask<C>>)>,
  events: Vec<EventSpec>,
  on_error: Option<OnErrorFn>,
}

impl<C> IntegrationBuilder<C>
where
  C: Send + Sync + 'static,
{
  /// Use a single pre-authenticated client (local auth).
  pub fn client(mut self, client: C) -> Self {
    self.client = Some(Arc::new(client));
    self
  }

  /// Build a client per run from connection credentials (delegated auth).
  pub fn client_factory<F>(mut self, factory: F) -> Self
  where
    F: Fn(&Credentials) -> Result<C, IntegrationError> + Send + Sync + 'static,
  {
    self.factory = Some(Arc::new(factory));
    self
  }

  pub fn task<T>(mut self, name: impl Into<String>, task: T) -> Self
  where
    T: AuthenticatedTask<C> + 'static,
  {
    self.tasks.push((name.into(), Arc::new(task)));
    self
  }

  /// A webhook event the integration can deliver.
  pub fn event(mut self, event: EventSpec) -> Self {
    self.events.push(event);
    self
  }

  /// Shared error handler for every task of the integration.
  pub fn on_error<F>(mut self, on_error: F) -> Self
  where
    F: Fn(&TaskError, &TaskHandle) -> OnErrorOutcome + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(on_error));
    self
  }

  pub fn build(self) -> Result<Integration<C>, IntegrationError> {
    let id = self.metadata.id.clone();
    if id.trim().is_empty() {
      return Err(IntegrationError::MissingId);
    }

    let client = match (self.client, self.factory) {
      (Some(client), None) => ClientSource::Local(client),
      (None, Some(factory)) => ClientSource::Factory(factory),
      (Some(_), Some(_)) => return Err(IntegrationError::ConflictingClient { id }),
      (None, None) => return Err(IntegrationError::MissingClient { id }),
    };

    let mut tasks = BTreeMap::new();
    for (name, task) in self.tasks {
      if tasks.insert(name.clone(), task).is_some() {
        return Err(IntegrationError::DuplicateTask { id, task: name });
      }
    }

    Ok(Integration {
      metadata: self.metadata,
      client,
      tasks,
      events: self.events,
      on_error: self.on_error,
    })
  }
}
