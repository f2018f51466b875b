use serde::{Deserialize, Serialize};

/// The condition that starts a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDef {
  /// Five-field cron expression, evaluated in UTC.
  Cron { expression: String },

  /// Fixed interval between runs.
  Interval { seconds: u64 },

  /// Named event sent to the client.
  Event {
    name: String,
    /// Only accept events emitted by this source.
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    /// JSON schema the event payload must satisfy.
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<serde_json::Value>,
    /// Payload filter; each leaf is an array of accepted values.
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<serde_json::Value>,
  },

  /// Trigger whose sub-triggers are added and removed at runtime.
  Dynamic { id: String },

  /// Webhook event delivered through an integration. `integration` is the
  /// alias under which the job declares the integration.
  Webhook { integration: String, event: String },
}

impl TriggerDef {
  pub fn cron(expression: impl Into<String>) -> Self {
    Self::Cron {
      expression: expression.into(),
    }
  }

  pub fn interval(seconds: u64) -> Self {
    Self::Interval { seconds }
  }

  pub fn event(name: impl Into<String>) -> Self {
    Self::Event {
      name: name.into(),
      source: None,
      schema: None,
      filter: None,
    }
  }

  /// Short label used in logs and trigger events.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Cron { .. } => "cron",
      Self::Interval { .. } => "interval",
      Self::Event { .. } => "event",
      Self::Dynamic { .. } => "dynamic",
      Self::Webhook { .. } => "webhook",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_event_trigger_tagging() {
    let def: TriggerDef = serde_json::from_value(json!({
      "type": "event",
      "name": "user.created",
      "schema": { "type": "object", "required": ["id"] }
    }))
    .unwrap();

    match def {
      TriggerDef::Event {
        name,
        source,
        schema,
        filter,
      } => {
        assert_eq!(name, "user.created");
        assert!(source.is_none());
        assert!(schema.is_some());
        assert!(filter.is_none());
      }
      other => panic!("unexpected trigger: {:?}", other),
    }
  }

  #[test]
  fn test_webhook_serializes_with_tag() {
    let def = TriggerDef::Webhook {
      integration: "github".to_string(),
      event: "push".to_string(),
    };
    let value = serde_json::to_value(&def).unwrap();
    assert_eq!(value["type"], "webhook");
    assert_eq!(def.kind(), "webhook");
  }
}
