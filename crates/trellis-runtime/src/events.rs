//! Execution events and notifiers for observability.
//!
//! Events are emitted while a run executes so consumers can observe
//! progress, stream it to a UI, or collect it in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use trellis_trigger::SentEvent;

use crate::task::TaskError;

/// Severity of a run log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
  Info,
  Warn,
  Error,
}

/// Events emitted during run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A new run has started.
  RunStarted { run_id: String, job_id: String },

  /// An unfinished run is executing again.
  RunResumed { run_id: String, job_id: String },

  /// A task attempt has started.
  TaskStarted {
    run_id: String,
    key: String,
    attempt: u32,
  },

  /// A task returned its recorded output without running.
  TaskResumed { run_id: String, key: String },

  /// A task attempt failed and another is scheduled.
  TaskRetrying {
    run_id: String,
    key: String,
    attempt: u32,
    retry_at: chrono::DateTime<chrono::Utc>,
    error: TaskError,
  },

  /// A task has completed successfully.
  TaskCompleted {
    run_id: String,
    key: String,
    output: serde_json::Value,
  },

  /// A task has failed for good.
  TaskFailed {
    run_id: String,
    key: String,
    error: TaskError,
  },

  /// A log line written by the run.
  RunLog {
    run_id: String,
    level: LogLevel,
    message: String,
    data: serde_json::Value,
  },

  /// The run has completed successfully.
  RunCompleted {
    run_id: String,
    output: serde_json::Value,
  },

  /// The run stopped early and can be resumed.
  RunInterrupted { run_id: String, reason: String },

  /// The run has failed.
  RunFailed { run_id: String, error: String },
}

/// Trait for receiving execution events.
///
/// The runtime calls `notify` for each event; implementations decide what
/// to do with them.
pub trait ExecutionNotifier: Send + Sync {
  /// Called when an execution event occurs.
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  /// Create a new channel notifier.
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

/// Destination for events sent from inside a run with `Io::send_event`.
#[async_trait]
pub trait EventSink: Send + Sync {
  async fn send(&self, event: SentEvent) -> Result<(), TaskError>;
}
