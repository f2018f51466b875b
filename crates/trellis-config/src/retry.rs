use serde::{Deserialize, Serialize};

/// Retry policy for a task.
///
/// `limit` counts retries, so a task runs at most `limit + 1` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
  pub limit: u32,
  #[serde(default = "default_factor")]
  pub factor: f64,
  #[serde(default = "default_min_timeout_ms")]
  pub min_timeout_ms: u64,
  #[serde(default = "default_max_timeout_ms")]
  pub max_timeout_ms: u64,
  #[serde(default)]
  pub randomize: bool,
}

fn default_factor() -> f64 {
  1.8
}

fn default_min_timeout_ms() -> u64 {
  1_000
}

fn default_max_timeout_ms() -> u64 {
  60_000
}

impl RetryPolicy {
  /// No retries: the first failure is final.
  pub fn none() -> Self {
    Self {
      limit: 0,
      ..Self::standard()
    }
  }

  /// Policy used by integration tasks that do not declare their own.
  pub fn standard() -> Self {
    Self {
      limit: 10,
      factor: default_factor(),
      min_timeout_ms: default_min_timeout_ms(),
      max_timeout_ms: default_max_timeout_ms(),
      randomize: true,
    }
  }

  pub fn with_limit(mut self, limit: u32) -> Self {
    self.limit = limit;
    self
  }

  pub fn with_timeouts(mut self, min_timeout_ms: u64, max_timeout_ms: u64) -> Self {
    self.min_timeout_ms = min_timeout_ms;
    self.max_timeout_ms = max_timeout_ms;
    self
  }

  pub fn with_randomize(mut self, randomize: bool) -> Self {
    self.randomize = randomize;
    self
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::none()
  }
}
