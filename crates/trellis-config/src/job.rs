use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::trigger::TriggerDef;

/// Serializable job definition.
///
/// `id` and `version` together identify a deployable definition: bumping the
/// version creates a new logical job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDef {
  pub id: String,
  pub name: String,
  pub version: String,
  pub trigger: TriggerDef,
  /// Integration aliases used by the job, mapped to integration ids.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub integrations: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub queue: Option<QueueDef>,
}

impl JobDef {
  pub fn new(
    id: impl Into<String>,
    name: impl Into<String>,
    version: impl Into<String>,
    trigger: TriggerDef,
  ) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      version: version.into(),
      trigger,
      integrations: BTreeMap::new(),
      queue: None,
    }
  }

  pub fn with_queue(mut self, name: impl Into<String>, max_concurrent: Option<u32>) -> Self {
    self.queue = Some(QueueDef {
      name: name.into(),
      max_concurrent,
    });
    self
  }
}

/// Named queue shared between jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDef {
  pub name: String,
  /// Maximum runs executing at once across every job on this queue.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_concurrent: Option<u32>,
}
