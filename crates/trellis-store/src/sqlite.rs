use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::{Error, RunRecord, Store, TaskRecord};

/// SQLite-based store implementation.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) a database file and apply migrations.
  pub async fn connect(path: impl AsRef<Path>) -> Result<Self, Error> {
    Self::open(path.as_ref(), true).await
  }

  /// Open a database file only if it already exists.
  pub async fn connect_existing(path: impl AsRef<Path>) -> Result<Option<Self>, Error> {
    let path = path.as_ref();
    if !path.is_file() {
      return Ok(None);
    }
    Self::open(path, false).await.map(Some)
  }

  async fn open(path: &Path, create: bool) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(create)
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// A migrated in-memory database. Uses a single connection since every
  /// connection to `sqlite::memory:` is a separate database.
  pub async fn in_memory() -> Result<Self, Error> {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect("sqlite::memory:")
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
  err
    .as_database_error()
    .is_some_and(|e| e.is_unique_violation())
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_run(&self, run: &RunRecord) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
            INSERT INTO runs (run_id, job_id, job_version, status, payload, context, output, error, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&run.run_id)
    .bind(&run.job_id)
    .bind(&run.job_version)
    .bind(run.status)
    .bind(&run.payload)
    .bind(&run.context)
    .bind(&run.output)
    .bind(&run.error)
    .bind(run.started_at)
    .bind(run.completed_at)
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(()),
      Err(e) if is_unique_violation(&e) => Err(Error::AlreadyExists(run.run_id.clone())),
      Err(e) => Err(e.into()),
    }
  }

  async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, Error> {
    let run = sqlx::query_as(
      r#"
            SELECT run_id, job_id, job_version, status, payload, context, output, error, started_at, completed_at
            FROM runs
            WHERE run_id = ?
            "#,
    )
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(run)
  }

  async fn update_run(&self, run: &RunRecord) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
            UPDATE runs
            SET status = ?, payload = ?, context = ?, output = ?, error = ?, completed_at = ?
            WHERE run_id = ?
            "#,
    )
    .bind(run.status)
    .bind(&run.payload)
    .bind(&run.context)
    .bind(&run.output)
    .bind(&run.error)
    .bind(run.completed_at)
    .bind(&run.run_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(run.run_id.clone()));
    }
    Ok(())
  }

  async fn list_runs(&self, job_id: &str) -> Result<Vec<RunRecord>, Error> {
    let runs = sqlx::query_as(
      r#"
            SELECT run_id, job_id, job_version, status, payload, context, output, error, started_at, completed_at
            FROM runs
            WHERE job_id = ?
            ORDER BY started_at DESC, rowid DESC
            "#,
    )
    .bind(job_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(runs)
  }

  async fn get_task(&self, run_id: &str, key: &str) -> Result<Option<TaskRecord>, Error> {
    let task = sqlx::query_as(
      r#"
            SELECT run_id, task_key, parent_key, name, status, attempt, depth, sequence, params, display,
                   output, error, retry_at, started_at, completed_at
            FROM tasks
            WHERE run_id = ? AND task_key = ?
            "#,
    )
    .bind(run_id)
    .bind(key)
    .fetch_optional(&self.pool)
    .await?;

    Ok(task)
  }

  async fn upsert_task(&self, task: &TaskRecord) -> Result<(), Error> {
    sqlx::query(
      r#"
            INSERT INTO tasks (run_id, task_key, parent_key, name, status, attempt, depth, sequence, params,
                               display, output, error, retry_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id, task_key) DO UPDATE SET
              name = excluded.name,
              status = excluded.status,
              attempt = excluded.attempt,
              params = excluded.params,
              display = excluded.display,
              output = excluded.output,
              error = excluded.error,
              retry_at = excluded.retry_at,
              completed_at = excluded.completed_at
            "#,
    )
    .bind(&task.run_id)
    .bind(&task.key)
    .bind(&task.parent_key)
    .bind(&task.name)
    .bind(task.status)
    .bind(task.attempt)
    .bind(task.depth)
    .bind(task.sequence)
    .bind(&task.params)
    .bind(&task.display)
    .bind(&task.output)
    .bind(&task.error)
    .bind(task.retry_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_tasks(&self, run_id: &str) -> Result<Vec<TaskRecord>, Error> {
    let tasks = sqlx::query_as(
      r#"
            SELECT run_id, task_key, parent_key, name, status, attempt, depth, sequence, params, display,
                   output, error, retry_at, started_at, completed_at
            FROM tasks
            WHERE run_id = ?
            ORDER BY sequence ASC
            "#,
    )
    .bind(run_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(tasks)
  }
}
