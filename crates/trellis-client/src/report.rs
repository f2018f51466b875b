use trellis_runtime::{JobKey, RunResult};
use trellis_trigger::TriggerError;

use crate::error::ClientError;

/// Outcome of dispatching one occurrence to every registered job.
#[derive(Debug, Default)]
pub struct DispatchReport {
  /// Runs started by the occurrence, in job order.
  pub runs: Vec<RunResult>,
  /// Triggers that matched but refused the payload. No run was started.
  pub rejected: Vec<Rejection>,
  /// Runs that could not be executed.
  pub failed: Vec<DispatchFailure>,
}

impl DispatchReport {
  /// Whether nothing reacted to the occurrence.
  pub fn is_empty(&self) -> bool {
    self.runs.is_empty() && self.rejected.is_empty() && self.failed.is_empty()
  }
}

#[derive(Debug)]
pub struct Rejection {
  pub job: JobKey,
  pub error: TriggerError,
}

#[derive(Debug)]
pub struct DispatchFailure {
  pub job: JobKey,
  pub error: ClientError,
}
