//! Trellis Store
//!
//! This crate provides the storage trait and implementations for runs and
//! their tasks. Task records are what make a run resumable: a run that is
//! executed again replays completed tasks from their stored output instead
//! of running them twice.
//!
//! The [`Store`] trait defines operations for:
//! - Creating, updating and listing runs
//! - Recording task attempts keyed by `(run_id, key)`
//! - Querying a run's task history in creation order

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use sqlx::types::Json;
pub use types::{RunRecord, RunStatus, TaskRecord, TaskStatus};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A record with the same identity already exists.
  #[error("already exists: {0}")]
  AlreadyExists(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Storage trait for runs and tasks.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a new run.
  async fn create_run(&self, run: &RunRecord) -> Result<(), Error>;

  /// Get a run by ID.
  async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, Error>;

  /// Replace the mutable fields of an existing run.
  async fn update_run(&self, run: &RunRecord) -> Result<(), Error>;

  /// List runs for a job, most recent first.
  async fn list_runs(&self, job_id: &str) -> Result<Vec<RunRecord>, Error>;

  /// Get a task by run and full key.
  async fn get_task(&self, run_id: &str, key: &str) -> Result<Option<TaskRecord>, Error>;

  /// Insert a task or replace the record with the same `(run_id, key)`.
  async fn upsert_task(&self, task: &TaskRecord) -> Result<(), Error>;

  /// List tasks for a run in creation order.
  async fn list_tasks(&self, run_id: &str) -> Result<Vec<TaskRecord>, Error>;
}
