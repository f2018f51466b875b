use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use trellis_trigger::TriggerEvent;

/// Identifiers and inputs available to a run function.
///
/// Everything except `connections` is persisted with the run. Connections
/// are supplied again each time the run executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
  pub organization_id: Option<String>,
  pub endpoint_id: String,
  pub job_id: String,
  pub job_version: String,
  pub run_id: String,
  /// The trigger event that started the run. `None` for manual invocations.
  pub event: Option<TriggerEvent>,
  #[serde(skip)]
  pub connections: HashMap<String, Credentials>,
}

impl RunContext {
  /// Credentials connected for an integration id.
  pub fn connection(&self, integration_id: &str) -> Option<&Credentials> {
    self.connections.get(integration_id)
  }
}

/// Per-run credentials for a delegated-auth integration.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
  pub access_token: String,
  #[serde(default)]
  pub scopes: Vec<String>,
  #[serde(default)]
  pub additional_fields: BTreeMap<String, String>,
}

impl Credentials {
  pub fn new(access_token: impl Into<String>) -> Self {
    Self {
      access_token: access_token.into(),
      ..Self::default()
    }
  }

  pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.scopes = scopes.into_iter().map(Into::into).collect();
    self
  }
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("access_token", &"<redacted>")
      .field("scopes", &self.scopes)
      .field("additional_fields", &self.additional_fields.keys().collect::<Vec<_>>())
      .finish()
  }
}
