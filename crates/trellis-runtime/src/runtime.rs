//! Run execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use trellis_config::ClientConfig;
use trellis_store::{Json, RunRecord, RunStatus, Store, TaskRecord};
use trellis_trigger::TriggerEvent;

use crate::context::{Credentials, RunContext};
use crate::error::RunError;
use crate::events::{EventSink, ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::io::{Io, RunState};
use crate::job::Job;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  pub endpoint_id: String,
  pub organization_id: Option<String>,
  /// Longest a single execution may take before the run is interrupted.
  pub max_run_duration: Option<Duration>,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      endpoint_id: trellis_config::DEFAULT_ENDPOINT_ID.to_string(),
      organization_id: None,
      max_run_duration: None,
    }
  }
}

impl From<&ClientConfig> for RuntimeConfig {
  fn from(config: &ClientConfig) -> Self {
    Self {
      endpoint_id: config.endpoint_id.clone(),
      organization_id: config.organization_id.clone(),
      max_run_duration: config.max_run_duration_ms.map(Duration::from_millis),
    }
  }
}

/// A request to execute a run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
  /// Existing run to resume, or the id for a new run.
  pub run_id: Option<String>,
  pub payload: Value,
  pub event: Option<TriggerEvent>,
  pub connections: HashMap<String, Credentials>,
}

impl RunRequest {
  pub fn new(payload: Value) -> Self {
    Self {
      payload,
      ..Self::default()
    }
  }

  /// Execute an existing run again. Its stored payload is used.
  pub fn resume(run_id: impl Into<String>) -> Self {
    Self {
      run_id: Some(run_id.into()),
      ..Self::default()
    }
  }

  pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
    self.run_id = Some(run_id.into());
    self
  }

  pub fn with_event(mut self, event: TriggerEvent) -> Self {
    self.event = Some(event);
    self
  }

  pub fn with_connections(mut self, connections: HashMap<String, Credentials>) -> Self {
    self.connections = connections;
    self
  }
}

/// Result of a run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
  pub run_id: String,
  pub status: RunStatus,
  pub output: Option<Value>,
  pub error: Option<String>,
  /// Task records in invocation order.
  pub tasks: Vec<TaskRecord>,
}

enum Outcome {
  Finished(Result<Value, RunError>),
  Cancelled,
  TimedOut(Duration),
}

/// Executes runs of jobs against a store.
pub struct Runtime {
  config: RuntimeConfig,
  store: Arc<dyn Store>,
  notifier: Arc<dyn ExecutionNotifier>,
  events: Option<Arc<dyn EventSink>>,
}

impl Runtime {
  pub fn new(config: RuntimeConfig, store: Arc<dyn Store>) -> Self {
    Self {
      config,
      store,
      notifier: Arc::new(NoopNotifier),
      events: None,
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Where `Io::send_event` delivers events.
  pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
    self.events = Some(events);
    self
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  /// Execute a run.
  ///
  /// A new run validates the payload against the trigger schema before
  /// anything is recorded. An existing unfinished run resumes with its stored
  /// payload, replaying recorded tasks; a finished run returns its recorded
  /// result. Cancellation marks the run interrupted and returns
  /// [`RunError::Cancelled`]; exceeding the maximum duration marks it
  /// interrupted and returns the interrupted result.
  #[instrument(
    name = "run_execute",
    skip_all,
    fields(
      job_id = %job.id(),
      job_version = %job.version(),
    )
  )]
  pub async fn execute(
    &self,
    job: &Job,
    request: RunRequest,
    cancel: CancellationToken,
  ) -> Result<RunResult, RunError> {
    let existing = match &request.run_id {
      Some(run_id) => self.store.get_run(run_id).await?,
      None => None,
    };

    let (mut record, resumed) = match existing {
      Some(record) => {
        if record.job_id != job.id() || record.job_version != job.version() {
          return Err(RunError::Configuration {
            message: format!(
              "run '{}' belongs to {}@{}, not {}",
              record.run_id,
              record.job_id,
              record.job_version,
              job.key()
            ),
          });
        }
        if record.status.is_terminal() {
          return self.result(record).await;
        }
        (record, true)
      }
      None => (self.create_run(job, &request).await?, false),
    };

    let mut context: RunContext =
      serde_json::from_value(record.context.0.clone()).map_err(|e| RunError::Serialization {
        key: record.run_id.clone(),
        message: e.to_string(),
      })?;
    context.connections = request.connections;

    let run_id = record.run_id.clone();
    if resumed {
      record.status = RunStatus::Running;
      record.completed_at = None;
      self.store.update_run(&record).await?;
      info!(run_id = %run_id, "run_resumed");
      self.notifier.notify(ExecutionEvent::RunResumed {
        run_id: run_id.clone(),
        job_id: job.id().to_string(),
      });
    } else {
      info!(run_id = %run_id, payload = %record.payload.0, "run_started");
      self.notifier.notify(ExecutionEvent::RunStarted {
        run_id: run_id.clone(),
        job_id: job.id().to_string(),
      });
    }

    let next_sequence = self
      .store
      .list_tasks(&run_id)
      .await?
      .iter()
      .map(|t| t.sequence)
      .max()
      .unwrap_or(0)
      + 1;

    let run_cancel = cancel.child_token();
    let state = Arc::new(RunState::new(
      context.clone(),
      Arc::clone(&self.store),
      Arc::clone(&self.notifier),
      self.events.clone(),
      run_cancel.clone(),
      next_sequence,
    ));
    let run = (job.run_fn())(record.payload.0.clone(), Io::new(state), context);

    let max_duration = self.config.max_run_duration;
    let deadline = async move {
      match max_duration {
        Some(limit) => {
          tokio::time::sleep(limit).await;
          limit
        }
        None => std::future::pending().await,
      }
    };

    let outcome = tokio::select! {
      result = run => match result {
        Err(RunError::Cancelled) if run_cancel.is_cancelled() => Outcome::Cancelled,
        other => Outcome::Finished(other),
      },
      _ = run_cancel.cancelled() => Outcome::Cancelled,
      limit = deadline => Outcome::TimedOut(limit),
    };
    run_cancel.cancel();

    match outcome {
      Outcome::Finished(Ok(output)) => {
        record.status = RunStatus::Succeeded;
        record.output = Some(Json(output.clone()));
        record.error = None;
        record.completed_at = Some(Utc::now());
        self.store.update_run(&record).await?;

        info!(run_id = %run_id, "run_completed");
        self.notifier.notify(ExecutionEvent::RunCompleted {
          run_id: run_id.clone(),
          output,
        });
      }
      Outcome::Finished(Err(e)) => {
        let message = e.to_string();
        record.status = RunStatus::Failed;
        record.error = Some(message.clone());
        record.completed_at = Some(Utc::now());
        self.store.update_run(&record).await?;

        error!(run_id = %run_id, error = %message, "run_failed");
        self.notifier.notify(ExecutionEvent::RunFailed {
          run_id: run_id.clone(),
          error: message,
        });
      }
      Outcome::Cancelled => {
        self.interrupt(&mut record, "cancelled".to_string()).await?;
        return Err(RunError::Cancelled);
      }
      Outcome::TimedOut(limit) => {
        let reason = format!("exceeded maximum run duration of {}ms", limit.as_millis());
        self.interrupt(&mut record, reason).await?;
      }
    }

    self.result(record).await
  }

  async fn create_run(&self, job: &Job, request: &RunRequest) -> Result<RunRecord, RunError> {
    job.check_payload(&request.payload)?;

    let run_id = request
      .run_id
      .clone()
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let context = RunContext {
      organization_id: self.config.organization_id.clone(),
      endpoint_id: self.config.endpoint_id.clone(),
      job_id: job.id().to_string(),
      job_version: job.version().to_string(),
      run_id: run_id.clone(),
      event: request.event.clone(),
      connections: HashMap::new(),
    };
    let context = serde_json::to_value(&context).map_err(|e| RunError::Serialization {
      key: run_id.clone(),
      message: e.to_string(),
    })?;

    let record = RunRecord::new(
      run_id,
      job.id(),
      job.version(),
      request.payload.clone(),
      context,
    );
    self.store.create_run(&record).await?;
    Ok(record)
  }

  async fn interrupt(&self, record: &mut RunRecord, reason: String) -> Result<(), RunError> {
    record.status = RunStatus::Interrupted;
    self.store.update_run(record).await?;

    warn!(run_id = %record.run_id, reason = %reason, "run_interrupted");
    self.notifier.notify(ExecutionEvent::RunInterrupted {
      run_id: record.run_id.clone(),
      reason,
    });
    Ok(())
  }

  async fn result(&self, record: RunRecord) -> Result<RunResult, RunError> {
    let tasks = self.store.list_tasks(&record.run_id).await?;
    Ok(RunResult {
      run_id: record.run_id,
      status: record.status,
      output: record.output.map(|o| o.0),
      error: record.error,
      tasks,
    })
  }
}
