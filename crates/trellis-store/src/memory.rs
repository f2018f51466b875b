use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Error, RunRecord, Store, TaskRecord};

/// In-process store. State is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
  runs: RwLock<HashMap<String, RunRecord>>,
  tasks: RwLock<HashMap<(String, String), TaskRecord>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_run(&self, run: &RunRecord) -> Result<(), Error> {
    let mut runs = self.runs.write().await;
    if runs.contains_key(&run.run_id) {
      return Err(Error::AlreadyExists(run.run_id.clone()));
    }
    runs.insert(run.run_id.clone(), run.clone());
    Ok(())
  }

  async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, Error> {
    Ok(self.runs.read().await.get(run_id).cloned())
  }

  async fn update_run(&self, run: &RunRecord) -> Result<(), Error> {
    let mut runs = self.runs.write().await;
    match runs.get_mut(&run.run_id) {
      Some(existing) => {
        *existing = run.clone();
        Ok(())
      }
      None => Err(Error::NotFound(run.run_id.clone())),
    }
  }

  async fn list_runs(&self, job_id: &str) -> Result<Vec<RunRecord>, Error> {
    let mut runs: Vec<RunRecord> = self
      .runs
      .read()
      .await
      .values()
      .filter(|r| r.job_id == job_id)
      .cloned()
      .collect();
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(runs)
  }

  async fn get_task(&self, run_id: &str, key: &str) -> Result<Option<TaskRecord>, Error> {
    Ok(
      self
        .tasks
        .read()
        .await
        .get(&(run_id.to_string(), key.to_string()))
        .cloned(),
    )
  }

  async fn upsert_task(&self, task: &TaskRecord) -> Result<(), Error> {
    if !self.runs.read().await.contains_key(&task.run_id) {
      return Err(Error::NotFound(task.run_id.clone()));
    }
    self
      .tasks
      .write()
      .await
      .insert((task.run_id.clone(), task.key.clone()), task.clone());
    Ok(())
  }

  async fn list_tasks(&self, run_id: &str) -> Result<Vec<TaskRecord>, Error> {
    let mut tasks: Vec<TaskRecord> = self
      .tasks
      .read()
      .await
      .values()
      .filter(|t| t.run_id == run_id)
      .cloned()
      .collect();
    tasks.sort_by_key(|t| t.sequence);
    Ok(tasks)
  }
}
