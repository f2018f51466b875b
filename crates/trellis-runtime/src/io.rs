//! The io handle passed to run functions and task bodies.
//!
//! Every task invocation goes through [`Io::run_task`], which records the
//! task under its key so a run executed again returns recorded results
//! instead of repeating work.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use trellis_store::{Json, Store, TaskRecord, TaskStatus};
use trellis_trigger::SentEvent;

use crate::context::RunContext;
use crate::error::RunError;
use crate::events::{EventSink, ExecutionEvent, ExecutionNotifier, LogLevel};
use crate::retry::backoff_delay;
use crate::task::{OnErrorOutcome, TaskError, TaskHandle, TaskOptions};

/// Maximum depth of nested tasks. A top-level task has depth 1.
pub const MAX_NESTING_DEPTH: u32 = 5;

/// State shared by every io handle of one run execution.
pub(crate) struct RunState {
  pub(crate) run_id: String,
  pub(crate) context: RunContext,
  pub(crate) store: Arc<dyn Store>,
  pub(crate) notifier: Arc<dyn ExecutionNotifier>,
  pub(crate) events: Option<Arc<dyn EventSink>>,
  pub(crate) cancel: CancellationToken,
  active: Mutex<HashSet<String>>,
  next_sequence: AtomicI64,
}

impl RunState {
  pub(crate) fn new(
    context: RunContext,
    store: Arc<dyn Store>,
    notifier: Arc<dyn ExecutionNotifier>,
    events: Option<Arc<dyn EventSink>>,
    cancel: CancellationToken,
    next_sequence: i64,
  ) -> Self {
    Self {
      run_id: context.run_id.clone(),
      context,
      store,
      notifier,
      events,
      cancel,
      active: Mutex::new(HashSet::new()),
      next_sequence: AtomicI64::new(next_sequence),
    }
  }

  fn activate(self: &Arc<Self>, key: &str) -> Result<ActiveKey, RunError> {
    let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
    if !active.insert(key.to_string()) {
      return Err(RunError::DuplicateTaskKey {
        key: key.to_string(),
      });
    }
    Ok(ActiveKey {
      state: Arc::clone(self),
      key: key.to_string(),
    })
  }
}

/// Marks a key as active for as long as it is held.
struct ActiveKey {
  state: Arc<RunState>,
  key: String,
}

impl Drop for ActiveKey {
  fn drop(&mut self) {
    self
      .state
      .active
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.key);
  }
}

/// Handle for invoking tasks from a run function or a task body.
///
/// Inside a task body the handle is scoped to that task: keys are namespaced
/// under it and nesting depth increases by one.
#[derive(Clone)]
pub struct Io {
  state: Arc<RunState>,
  parent: Option<TaskHandle>,
}

impl Io {
  pub(crate) fn new(state: Arc<RunState>) -> Self {
    Self {
      state,
      parent: None,
    }
  }

  pub fn run_id(&self) -> &str {
    &self.state.run_id
  }

  pub fn context(&self) -> &RunContext {
    &self.state.context
  }

  /// The task this handle is scoped to, if any.
  pub fn parent(&self) -> Option<&TaskHandle> {
    self.parent.as_ref()
  }

  /// Depth of the scoping task; 0 in the run function.
  pub fn depth(&self) -> u32 {
    self.parent.as_ref().map_or(0, |p| p.depth)
  }

  pub fn is_cancelled(&self) -> bool {
    self.state.cancel.is_cancelled()
  }

  /// Run a task under `key`.
  ///
  /// A recorded success returns the stored output without calling `body`;
  /// a recorded failure returns the same failure. Otherwise `body` runs,
  /// retried per the options' retry policy and onError handler.
  #[instrument(
    name = "task",
    skip_all,
    fields(run_id = %self.state.run_id, key = %key)
  )]
  pub async fn run_task<T, F, Fut>(
    &self,
    key: &str,
    options: TaskOptions,
    body: F,
  ) -> Result<T, RunError>
  where
    T: Serialize + DeserializeOwned + Send,
    F: Fn(TaskHandle, Io) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, TaskError>> + Send,
  {
    let (full_key, depth) = self.prepare(key)?;
    let _active = self.state.activate(&full_key)?;
    let store = &self.state.store;
    let run_id = &self.state.run_id;

    let (mut record, mut attempt) = match store.get_task(run_id, &full_key).await? {
      Some(record) => match record.status {
        TaskStatus::Succeeded => {
          info!(run_id = %run_id, key = %full_key, "task_resumed");
          self.state.notifier.notify(ExecutionEvent::TaskResumed {
            run_id: run_id.clone(),
            key: full_key.clone(),
          });
          let output = record.output.map(|o| o.0).unwrap_or(Value::Null);
          return serde_json::from_value(output).map_err(|e| RunError::Serialization {
            key: full_key,
            message: e.to_string(),
          });
        }
        TaskStatus::Failed => {
          let error = record
            .error
            .and_then(|e| serde_json::from_value(e.0).ok())
            .unwrap_or_else(|| TaskError::fatal("task failed"));
          return Err(RunError::TaskFailed {
            key: full_key,
            attempts: record.attempt.max(1) as u32,
            error,
          });
        }
        TaskStatus::Waiting => {
          let attempt = record.attempt.max(1) as u32 + 1;
          if let Some(retry_at) = record.retry_at {
            self.sleep_until(retry_at).await?;
          }
          (record, attempt)
        }
        // Interrupted mid-attempt: run the same attempt again
        TaskStatus::Running => {
          let attempt = record.attempt.max(1) as u32;
          (record, attempt)
        }
      },
      None => {
        let name = options.name.clone().unwrap_or_else(|| key.to_string());
        let record = self.new_record(
          &full_key,
          depth,
          name,
          options.params.clone(),
          options.display(),
        );
        (record, 1)
      }
    };

    let policy = options.retry.clone().unwrap_or_default();

    loop {
      record.status = TaskStatus::Running;
      record.attempt = attempt as i32;
      record.retry_at = None;
      store.upsert_task(&record).await?;

      info!(run_id = %run_id, key = %full_key, attempt, "task_started");
      self.state.notifier.notify(ExecutionEvent::TaskStarted {
        run_id: run_id.clone(),
        key: full_key.clone(),
        attempt,
      });

      let handle = TaskHandle {
        run_id: run_id.clone(),
        key: full_key.clone(),
        parent_key: record.parent_key.clone(),
        name: record.name.clone(),
        attempt,
        depth,
        params: record.params.0.clone(),
      };
      let scoped = Io {
        state: Arc::clone(&self.state),
        parent: Some(handle.clone()),
      };

      let result = tokio::select! {
        result = body(handle.clone(), scoped) => result,
        _ = self.state.cancel.cancelled() => return Err(RunError::Cancelled),
      };

      let error = match result {
        Ok(value) => {
          let output = serde_json::to_value(&value).map_err(|e| RunError::Serialization {
            key: full_key.clone(),
            message: e.to_string(),
          })?;
          record.status = TaskStatus::Succeeded;
          record.output = Some(Json(output.clone()));
          record.error = None;
          record.completed_at = Some(Utc::now());
          store.upsert_task(&record).await?;

          info!(run_id = %run_id, key = %full_key, attempt, "task_completed");
          self.state.notifier.notify(ExecutionEvent::TaskCompleted {
            run_id: run_id.clone(),
            key: full_key.clone(),
            output,
          });
          return Ok(value);
        }
        Err(error) => error,
      };

      // A body that failed because the run was cancelled is not a task failure
      if self.state.cancel.is_cancelled() {
        return Err(RunError::Cancelled);
      }

      let outcome = match &options.on_error {
        Some(on_error) => on_error(&error, &handle),
        None => OnErrorOutcome::Unhandled,
      };
      let (error, requested_at) = match outcome {
        OnErrorOutcome::Unhandled => (error, None),
        OnErrorOutcome::Replace(replacement) => (replacement, None),
        OnErrorOutcome::RetryAt { retry_at, error } => (error, Some(retry_at)),
      };

      let retries_used = attempt - 1;
      let retryable = requested_at.is_some() || error.is_retryable();
      let error_json = serde_json::to_value(&error).unwrap_or_else(|_| json!(error.to_string()));

      if !retryable || retries_used >= policy.limit {
        record.status = TaskStatus::Failed;
        record.error = Some(Json(error_json));
        record.completed_at = Some(Utc::now());
        store.upsert_task(&record).await?;

        error!(run_id = %run_id, key = %full_key, attempt, error = %error, "task_failed");
        self.state.notifier.notify(ExecutionEvent::TaskFailed {
          run_id: run_id.clone(),
          key: full_key.clone(),
          error: error.clone(),
        });
        return Err(RunError::TaskFailed {
          key: full_key,
          attempts: attempt,
          error,
        });
      }

      let retry_at = match requested_at.or_else(|| error.retry_at()) {
        Some(at) => at,
        None => {
          let delay = backoff_delay(&policy, attempt, &mut rand::thread_rng());
          Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
        }
      };

      record.status = TaskStatus::Waiting;
      record.error = Some(Json(error_json));
      record.retry_at = Some(retry_at);
      store.upsert_task(&record).await?;

      warn!(
        run_id = %run_id,
        key = %full_key,
        attempt,
        retry_at = %retry_at,
        error = %error,
        "task_retrying"
      );
      self.state.notifier.notify(ExecutionEvent::TaskRetrying {
        run_id: run_id.clone(),
        key: full_key.clone(),
        attempt,
        retry_at,
        error,
      });

      self.sleep_until(retry_at).await?;
      attempt += 1;
    }
  }

  /// Durable sleep. A run executed again after the wait elapsed continues
  /// immediately; one executed before waits only for the remainder.
  pub async fn wait(&self, key: &str, duration: Duration) -> Result<(), RunError> {
    let (full_key, depth) = self.prepare(key)?;
    let _active = self.state.activate(&full_key)?;
    let store = &self.state.store;

    let mut record = match store.get_task(&self.state.run_id, &full_key).await? {
      Some(record) if record.status == TaskStatus::Succeeded => {
        info!(run_id = %self.state.run_id, key = %full_key, "task_resumed");
        self.state.notifier.notify(ExecutionEvent::TaskResumed {
          run_id: self.state.run_id.clone(),
          key: full_key,
        });
        return Ok(());
      }
      Some(record) => record,
      None => {
        let delta = chrono::Duration::from_std(duration).map_err(|e| RunError::Configuration {
          message: format!("wait duration out of range: {}", e),
        })?;
        let mut record = self.new_record(
          &full_key,
          depth,
          "wait".to_string(),
          json!({ "seconds": duration.as_secs_f64() }),
          json!({ "icon": "clock", "properties": [] }),
        );
        record.status = TaskStatus::Waiting;
        record.retry_at = Some(record.started_at + delta);
        store.upsert_task(&record).await?;
        record
      }
    };

    if let Some(until) = record.retry_at {
      self.sleep_until(until).await?;
    }

    record.status = TaskStatus::Succeeded;
    record.output = Some(Json(Value::Null));
    record.completed_at = Some(Utc::now());
    store.upsert_task(&record).await?;
    Ok(())
  }

  /// A random number in `[min, max)`, recorded so every execution of the run
  /// sees the same value.
  pub async fn random(&self, key: &str, min: f64, max: f64) -> Result<f64, RunError> {
    if !(min < max) {
      return Err(RunError::Configuration {
        message: format!("random range is empty: [{}, {})", min, max),
      });
    }
    let options = TaskOptions::new("random").with_params(json!({ "min": min, "max": max }));
    self
      .run_task(key, options, move |_, _| async move {
        Ok(min + rand::random::<f64>() * (max - min))
      })
      .await
  }

  /// Send an event to the client. Recorded, so the event is sent once per
  /// run even when the run executes again.
  pub async fn send_event(
    &self,
    key: &str,
    name: impl Into<String>,
    payload: Value,
  ) -> Result<SentEvent, RunError> {
    let sink = self
      .state
      .events
      .clone()
      .ok_or_else(|| RunError::Configuration {
        message: "no event sink is configured for this runtime".to_string(),
      })?;
    let name = name.into();
    let source = self.state.context.job_id.clone();
    let options = TaskOptions::new("send-event")
      .with_params(json!({ "name": name, "payload": payload }))
      .with_icon("send")
      .with_property("Event", name.clone());

    self
      .run_task(key, options, move |_, _| {
        let sink = Arc::clone(&sink);
        let event = SentEvent::new(name.clone(), payload.clone()).with_source(source.clone());
        async move {
          sink.send(event.clone()).await?;
          Ok(event)
        }
      })
      .await
  }

  pub fn log_info(&self, message: impl Into<String>) {
    self.log(LogLevel::Info, message.into(), Value::Null);
  }

  pub fn log_warn(&self, message: impl Into<String>) {
    self.log(LogLevel::Warn, message.into(), Value::Null);
  }

  pub fn log_error(&self, message: impl Into<String>) {
    self.log(LogLevel::Error, message.into(), Value::Null);
  }

  /// Log with structured data. Logs are not recorded and repeat when a run
  /// executes again.
  pub fn log(&self, level: LogLevel, message: String, data: Value) {
    let run_id = &self.state.run_id;
    match level {
      LogLevel::Info => info!(run_id = %run_id, data = %data, "{}", message),
      LogLevel::Warn => warn!(run_id = %run_id, data = %data, "{}", message),
      LogLevel::Error => error!(run_id = %run_id, data = %data, "{}", message),
    }
    self.state.notifier.notify(ExecutionEvent::RunLog {
      run_id: run_id.clone(),
      level,
      message,
      data,
    });
  }

  fn prepare(&self, key: &str) -> Result<(String, u32), RunError> {
    if key.trim().is_empty() {
      return Err(RunError::Configuration {
        message: "task key must not be empty".to_string(),
      });
    }
    if self.state.cancel.is_cancelled() {
      return Err(RunError::Cancelled);
    }

    let full_key = match &self.parent {
      Some(parent) => format!("{}/{}", parent.key, key),
      None => key.to_string(),
    };
    let depth = self.depth() + 1;
    if depth > MAX_NESTING_DEPTH {
      return Err(RunError::NestingLimit {
        key: full_key,
        depth,
        max: MAX_NESTING_DEPTH,
      });
    }
    Ok((full_key, depth))
  }

  fn new_record(
    &self,
    full_key: &str,
    depth: u32,
    name: String,
    params: Value,
    display: Value,
  ) -> TaskRecord {
    TaskRecord {
      run_id: self.state.run_id.clone(),
      key: full_key.to_string(),
      parent_key: self.parent.as_ref().map(|p| p.key.clone()),
      name,
      status: TaskStatus::Running,
      attempt: 1,
      depth: depth as i32,
      sequence: self.state.next_sequence.fetch_add(1, Ordering::SeqCst),
      params: Json(params),
      display: Json(display),
      output: None,
      error: None,
      retry_at: None,
      started_at: Utc::now(),
      completed_at: None,
    }
  }

  async fn sleep_until(&self, at: DateTime<Utc>) -> Result<(), RunError> {
    let delay = (at - Utc::now()).to_std().unwrap_or_default();
    tokio::select! {
      _ = tokio::time::sleep(delay) => Ok(()),
      _ = self.state.cancel.cancelled() => Err(RunError::Cancelled),
    }
  }
}
