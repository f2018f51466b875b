use serde::{Deserialize, Serialize};

/// Display metadata for an integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationMetadata {
  pub id: String,
  pub name: String,
}

/// An event an integration can deliver through a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  /// JSON schema of the webhook payload.
  pub schema: serde_json::Value,
}
