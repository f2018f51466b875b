//! Jobs: a definition bound to a run function.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_config::{EventSpec, IntegrationMetadata, JobDef, TriggerDef, Version};
use trellis_trigger::{Trigger, TriggerError};

use crate::context::RunContext;
use crate::error::RunError;
use crate::io::Io;

/// The run function of a job.
pub type RunFn =
  Arc<dyn Fn(Value, Io, RunContext) -> BoxFuture<'static, Result<Value, RunError>> + Send + Sync>;

/// What a job needs to know about an integration it uses.
pub trait IntegrationRef: Send + Sync {
  fn metadata(&self) -> &IntegrationMetadata;

  /// Webhook event definition by name.
  fn event(&self, name: &str) -> Option<&EventSpec>;
}

/// Identity of a deployable job definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
  pub id: String,
  pub version: String,
}

impl fmt::Display for JobKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.id, self.version)
  }
}

/// Configuration errors in a job definition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
  #[error("job id is required")]
  MissingId,

  #[error("job '{id}' requires a name")]
  MissingName { id: String },

  #[error("job '{id}' has an invalid version: {source}")]
  InvalidVersion {
    id: String,
    #[source]
    source: trellis_config::VersionError,
  },

  #[error("job '{id}' has an invalid trigger: {source}")]
  InvalidTrigger {
    id: String,
    #[source]
    source: TriggerError,
  },

  #[error("job '{id}' uses integration '{alias}' which is not provided")]
  UnknownIntegration { id: String, alias: String },

  #[error("integration '{integration}' has no event named '{event}'")]
  UnknownIntegrationEvent { integration: String, event: String },

  #[error("job '{id}' queue '{queue}' must allow at least one concurrent run")]
  InvalidQueue { id: String, queue: String },

  #[error("integration alias '{alias}' is declared as '{declared}' but bound to '{actual}'")]
  IntegrationMismatch {
    alias: String,
    declared: String,
    actual: String,
  },
}

/// Validate a definition on its own, without integration handles.
///
/// Webhook triggers are checked only for a declared integration alias; the
/// event itself is resolved when the job is bound to its integrations.
pub fn validate_definition(def: &JobDef) -> Result<Version, JobError> {
  if def.id.trim().is_empty() {
    return Err(JobError::MissingId);
  }
  if def.name.trim().is_empty() {
    return Err(JobError::MissingName { id: def.id.clone() });
  }
  let version = Version::parse(&def.version).map_err(|source| JobError::InvalidVersion {
    id: def.id.clone(),
    source,
  })?;

  if let Some(queue) = &def.queue {
    if queue.max_concurrent == Some(0) {
      return Err(JobError::InvalidQueue {
        id: def.id.clone(),
        queue: queue.name.clone(),
      });
    }
  }

  match &def.trigger {
    TriggerDef::Webhook { integration, .. } => {
      if !def.integrations.contains_key(integration) {
        return Err(JobError::UnknownIntegration {
          id: def.id.clone(),
          alias: integration.clone(),
        });
      }
    }
    other => {
      Trigger::compile(other).map_err(|source| JobError::InvalidTrigger {
        id: def.id.clone(),
        source,
      })?;
    }
  }

  Ok(version)
}

/// A job definition bound to its run function and integrations.
#[derive(Clone)]
pub struct Job {
  def: JobDef,
  run: RunFn,
  integrations: BTreeMap<String, Arc<dyn IntegrationRef>>,
  trigger: OnceLock<Result<Trigger, JobError>>,
}

impl Job {
  pub fn new<F, Fut>(def: JobDef, run: F) -> Self
  where
    F: Fn(Value, Io, RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RunError>> + Send + 'static,
  {
    Self {
      def,
      run: Arc::new(move |payload, io, ctx| Box::pin(run(payload, io, ctx))),
      integrations: BTreeMap::new(),
      trigger: OnceLock::new(),
    }
  }

  /// Bind an integration under `alias`, declaring it if the definition
  /// does not already.
  pub fn with_integration(
    mut self,
    alias: impl Into<String>,
    integration: Arc<dyn IntegrationRef>,
  ) -> Self {
    let alias = alias.into();
    self
      .def
      .integrations
      .entry(alias.clone())
      .or_insert_with(|| integration.metadata().id.clone());
    self.integrations.insert(alias, integration);
    self.trigger = OnceLock::new();
    self
  }

  pub fn def(&self) -> &JobDef {
    &self.def
  }

  pub fn id(&self) -> &str {
    &self.def.id
  }

  pub fn version(&self) -> &str {
    &self.def.version
  }

  pub fn key(&self) -> JobKey {
    JobKey {
      id: self.def.id.clone(),
      version: self.def.version.clone(),
    }
  }

  pub fn integration(&self, alias: &str) -> Option<&Arc<dyn IntegrationRef>> {
    self.integrations.get(alias)
  }

  /// Validate the definition and its integration bindings.
  pub fn validate(&self) -> Result<Version, JobError> {
    let version = validate_definition(&self.def)?;

    for (alias, declared) in &self.def.integrations {
      let bound = self
        .integrations
        .get(alias)
        .ok_or_else(|| JobError::UnknownIntegration {
          id: self.def.id.clone(),
          alias: alias.clone(),
        })?;
      let actual = &bound.metadata().id;
      if actual != declared {
        return Err(JobError::IntegrationMismatch {
          alias: alias.clone(),
          declared: declared.clone(),
          actual: actual.clone(),
        });
      }
    }

    self.compile_trigger()?;
    Ok(version)
  }

  /// Compile the trigger, resolving webhook triggers through the bound
  /// integration's event definitions.
  pub fn compile_trigger(&self) -> Result<Trigger, JobError> {
    self.trigger().cloned()
  }

  /// Check a run payload against the trigger's schema.
  pub fn check_payload(&self, payload: &Value) -> Result<(), RunError> {
    let trigger = self.trigger().map_err(|e| RunError::Validation {
      message: e.to_string(),
    })?;
    trigger.validate(payload).map_err(|e| match e {
      TriggerError::Validation { violations, .. } => RunError::Validation {
        message: violations.join("; "),
      },
      other => RunError::Validation {
        message: other.to_string(),
      },
    })
  }

  fn trigger(&self) -> Result<&Trigger, JobError> {
    self
      .trigger
      .get_or_init(|| self.resolve_trigger())
      .as_ref()
      .map_err(Clone::clone)
  }

  fn resolve_trigger(&self) -> Result<Trigger, JobError> {
    let invalid = |source| JobError::InvalidTrigger {
      id: self.def.id.clone(),
      source,
    };

    match &self.def.trigger {
      TriggerDef::Webhook { integration, event } => {
        let bound = self.bound(integration)?;
        let spec = bound
          .event(event)
          .ok_or_else(|| JobError::UnknownIntegrationEvent {
            integration: bound.metadata().id.clone(),
            event: event.clone(),
          })?;
        Trigger::webhook(bound.metadata().id.clone(), event.clone(), Some(spec.schema.clone()))
          .map_err(invalid)
      }
      other => Trigger::compile(other).map_err(invalid),
    }
  }

  /// Schema a payload must satisfy to start a run, if the trigger has one.
  pub fn payload_schema(&self) -> Option<&Value> {
    match &self.def.trigger {
      TriggerDef::Event { schema, .. } => schema.as_ref(),
      TriggerDef::Webhook { integration, event } => self
        .integrations
        .get(integration)
        .and_then(|bound| bound.event(event))
        .map(|spec| &spec.schema),
      _ => None,
    }
  }

  pub(crate) fn run_fn(&self) -> &RunFn {
    &self.run
  }

  fn bound(&self, alias: &str) -> Result<&Arc<dyn IntegrationRef>, JobError> {
    self
      .integrations
      .get(alias)
      .ok_or_else(|| JobError::UnknownIntegration {
        id: self.def.id.clone(),
        alias: alias.to_string(),
      })
  }
}

impl fmt::Debug for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("def", &self.def)
      .field("integrations", &self.integrations.keys().collect::<Vec<_>>())
      .finish()
  }
}
