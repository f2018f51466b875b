use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a registered trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
  Idle,
  Armed,
  Fired,
}

/// An event sent to the client, by an external caller or by `io.send_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentEvent {
  pub id: String,
  pub name: String,
  pub payload: serde_json::Value,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
  pub timestamp: DateTime<Utc>,
}

impl SentEvent {
  pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      name: name.into(),
      payload,
      source: None,
      timestamp: Utc::now(),
    }
  }

  pub fn with_source(mut self, source: impl Into<String>) -> Self {
    self.source = Some(source.into());
    self
  }
}

/// Something external that a trigger may react to.
#[derive(Debug, Clone, PartialEq)]
pub enum Occurrence {
  /// The clock reached this instant.
  Tick(DateTime<Utc>),

  /// An event was sent.
  Event(SentEvent),

  /// An integration delivered a webhook.
  Webhook {
    integration: String,
    event: String,
    payload: serde_json::Value,
  },
}

/// Event emitted by a trigger to start a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
  /// Unique identifier for this trigger event
  pub event_id: String,

  /// Kind of trigger that fired (cron, interval, event, webhook)
  pub trigger: String,

  /// Event name for event and webhook triggers
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,

  /// Sub-trigger key when fired through a dynamic trigger
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,

  /// Payload handed to the run
  pub payload: serde_json::Value,

  pub timestamp: DateTime<Utc>,
}
