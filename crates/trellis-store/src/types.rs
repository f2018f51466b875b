use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Running,
  /// Stopped before finishing; executing the run again resumes it.
  Interrupted,
  Succeeded,
  Failed,
}

impl RunStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Succeeded | Self::Failed)
  }
}

/// Status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
  Running,
  /// Failed an attempt and waiting for `retry_at`.
  Waiting,
  Succeeded,
  Failed,
}

/// A run as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
  pub run_id: String,
  pub job_id: String,
  pub job_version: String,
  pub status: RunStatus,
  pub payload: Json<serde_json::Value>,
  pub context: Json<serde_json::Value>,
  pub output: Option<Json<serde_json::Value>>,
  pub error: Option<String>,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
  /// A fresh record in the running state.
  pub fn new(
    run_id: impl Into<String>,
    job_id: impl Into<String>,
    job_version: impl Into<String>,
    payload: serde_json::Value,
    context: serde_json::Value,
  ) -> Self {
    Self {
      run_id: run_id.into(),
      job_id: job_id.into(),
      job_version: job_version.into(),
      status: RunStatus::Running,
      payload: Json(payload),
      context: Json(context),
      output: None,
      error: None,
      started_at: Utc::now(),
      completed_at: None,
    }
  }
}

/// A task attempt record, unique per `(run_id, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskRecord {
  pub run_id: String,
  /// Full key, with parent keys joined by `/`.
  #[sqlx(rename = "task_key")]
  pub key: String,
  pub parent_key: Option<String>,
  pub name: String,
  pub status: TaskStatus,
  pub attempt: i32,
  pub depth: i32,
  /// Position in the run, used for ordering.
  pub sequence: i64,
  pub params: Json<serde_json::Value>,
  /// Display metadata: icon and properties.
  pub display: Json<serde_json::Value>,
  pub output: Option<Json<serde_json::Value>>,
  pub error: Option<Json<serde_json::Value>>,
  pub retry_at: Option<DateTime<Utc>>,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}
