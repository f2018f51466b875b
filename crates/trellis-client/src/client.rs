use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use trellis_config::{ClientConfig, QueueDef, Version};
use trellis_runtime::{
  Credentials, ExecutionNotifier, Job, JobError, JobKey, RunRequest, RunResult, Runtime,
  RuntimeConfig,
};
use trellis_store::{RunStatus, Store};
use trellis_trigger::{ArmedTrigger, DynamicTrigger, Occurrence, SentEvent, Trigger};

use crate::error::ClientError;
use crate::report::{DispatchFailure, DispatchReport, Rejection};
use crate::sink::ChannelSink;

const DEFAULT_BUFFER_SIZE: usize = 100;

struct Registration {
  job: Job,
  trigger: Mutex<ArmedTrigger>,
  queue: Option<Arc<Semaphore>>,
}

/// Registry of jobs and the entry point for everything that starts a run.
///
/// Occurrences (clock ticks, sent events, webhook deliveries) are dispatched
/// to every armed trigger; each firing starts one run. Runs of jobs sharing a
/// queue are limited by the queue's `max_concurrent`.
///
/// # Usage
///
/// ```ignore
/// let client = Arc::new(Client::new(ClientConfig::from_env()?, store));
/// client.register(job)?;
///
/// // Feed occurrences from webhooks, UI handlers, etc.
/// let sender = client.sender();
///
/// let cancel = CancellationToken::new();
/// client.start(cancel, Duration::from_secs(1)).await?;
/// ```
pub struct Client {
  config: ClientConfig,
  runtime: Runtime,
  jobs: RwLock<BTreeMap<JobKey, Registration>>,
  dynamic: Mutex<HashMap<String, DynamicTrigger>>,
  connections: RwLock<HashMap<String, Credentials>>,
  queues: Mutex<HashMap<String, Arc<Semaphore>>>,
  in_flight: Mutex<HashSet<String>>,
  pub(crate) sender: mpsc::Sender<Occurrence>,
  pub(crate) receiver: Mutex<Option<mpsc::Receiver<Occurrence>>>,
  pub(crate) cancel: CancellationToken,
}

impl Client {
  pub fn new(config: ClientConfig, store: Arc<dyn Store>) -> Self {
    Self::with_buffer_size(config, store, DEFAULT_BUFFER_SIZE)
  }

  /// Create a client whose occurrence channel holds `buffer_size` entries.
  pub fn with_buffer_size(config: ClientConfig, store: Arc<dyn Store>, buffer_size: usize) -> Self {
    let (sender, receiver) = mpsc::channel(buffer_size);
    let runtime = Runtime::new(RuntimeConfig::from(&config), store)
      .with_event_sink(Arc::new(ChannelSink::new(sender.clone())));

    Self {
      config,
      runtime,
      jobs: RwLock::new(BTreeMap::new()),
      dynamic: Mutex::new(HashMap::new()),
      connections: RwLock::new(HashMap::new()),
      queues: Mutex::new(HashMap::new()),
      in_flight: Mutex::new(HashSet::new()),
      sender,
      receiver: Mutex::new(Some(receiver)),
      cancel: CancellationToken::new(),
    }
  }

  /// Deliver execution events to `notifier`.
  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.runtime = self.runtime.with_notifier(notifier);
    self
  }

  pub fn config(&self) -> &ClientConfig {
    &self.config
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    self.runtime.store()
  }

  /// Sender for occurrences consumed by [`start`](Self::start).
  pub fn sender(&self) -> mpsc::Sender<Occurrence> {
    self.sender.clone()
  }

  /// Register a job and arm its trigger.
  #[instrument(
    name = "register",
    skip_all,
    fields(job_id = %job.id(), job_version = %job.version())
  )]
  pub fn register(&self, job: Job) -> Result<JobKey, ClientError> {
    job.validate()?;
    let trigger = match job.compile_trigger()? {
      Trigger::Dynamic(compiled) => Trigger::Dynamic(self.dynamic_trigger(compiled.id())),
      other => other,
    };

    let key = job.key();
    let mut jobs = write(&self.jobs);
    if jobs.contains_key(&key) {
      return Err(ClientError::AlreadyRegistered(key));
    }

    let mut armed = ArmedTrigger::new(trigger);
    armed
      .arm(Utc::now())
      .map_err(|source| JobError::InvalidTrigger {
        id: key.id.clone(),
        source,
      })?;
    let queue = job.def().queue.as_ref().and_then(|q| self.queue(q));

    info!(trigger = armed.trigger().kind(), "job_registered");
    jobs.insert(
      key.clone(),
      Registration {
        job,
        trigger: Mutex::new(armed),
        queue,
      },
    );
    Ok(key)
  }

  /// Registered job keys, ordered by id then version.
  pub fn jobs(&self) -> Vec<JobKey> {
    read(&self.jobs).keys().cloned().collect()
  }

  /// A registered job by id and exact version.
  pub fn job(&self, id: &str, version: &str) -> Option<Job> {
    let key = JobKey {
      id: id.to_string(),
      version: version.to_string(),
    };
    read(&self.jobs).get(&key).map(|r| r.job.clone())
  }

  /// Shared handle of the dynamic trigger `id`.
  ///
  /// Sub-triggers registered on the handle are seen by every job whose
  /// trigger is `dynamic` with this id, before or after the job registers.
  pub fn dynamic_trigger(&self, id: &str) -> DynamicTrigger {
    lock(&self.dynamic)
      .entry(id.to_string())
      .or_insert_with(|| DynamicTrigger::new(id))
      .clone()
  }

  /// Store credentials injected into the context of every run.
  pub fn connect(&self, integration_id: impl Into<String>, credentials: Credentials) {
    let integration_id = integration_id.into();
    info!(integration = %integration_id, "integration_connected");
    write(&self.connections).insert(integration_id, credentials);
  }

  /// Start a run manually. Without a version the highest registered
  /// version of the job is used.
  pub async fn invoke(
    &self,
    id: &str,
    version: Option<&str>,
    payload: Value,
  ) -> Result<RunResult, ClientError> {
    let (job, queue) = self.lookup(id, version)?;
    let request = RunRequest::new(payload).with_run_id(new_run_id());
    self.execute(job, queue, request).await
  }

  /// Execute an unfinished run again with its stored payload.
  pub async fn resume(&self, run_id: &str) -> Result<RunResult, ClientError> {
    let record = self
      .store()
      .get_run(run_id)
      .await?
      .ok_or_else(|| ClientError::RunNotFound(run_id.to_string()))?;
    let (job, queue) = self.lookup(&record.job_id, Some(&record.job_version))?;
    self.execute(job, queue, RunRequest::resume(run_id)).await
  }

  /// Resume every interrupted run of the registered jobs, and every run
  /// left running by a previous process.
  pub async fn resume_pending(&self) -> Vec<RunResult> {
    let ids: BTreeSet<String> = read(&self.jobs).keys().map(|k| k.id.clone()).collect();

    let mut pending = Vec::new();
    for id in ids {
      let runs = match self.store().list_runs(&id).await {
        Ok(runs) => runs,
        Err(e) => {
          error!(job_id = %id, error = %e, "failed to list runs");
          continue;
        }
      };
      let in_flight = lock(&self.in_flight);
      pending.extend(
        runs
          .into_iter()
          .filter(|run| {
            matches!(run.status, RunStatus::Interrupted | RunStatus::Running)
              && !in_flight.contains(&run.run_id)
          })
          .map(|run| run.run_id),
      );
    }

    let results = join_all(pending.iter().map(|run_id| self.resume(run_id))).await;
    results
      .into_iter()
      .zip(pending)
      .filter_map(|(result, run_id)| match result {
        Ok(run) => Some(run),
        Err(e) => {
          warn!(run_id = %run_id, error = %e, "failed to resume run");
          None
        }
      })
      .collect()
  }

  /// Evaluate every armed trigger against `occurrence` and start one run
  /// per firing. Fired triggers are re-armed once their runs are created.
  #[instrument(name = "dispatch", skip_all, fields(occurrence = occurrence_kind(&occurrence)))]
  pub async fn dispatch(&self, occurrence: Occurrence) -> DispatchReport {
    let now = Utc::now();
    let mut report = DispatchReport::default();
    let mut fired = Vec::new();

    {
      let jobs = read(&self.jobs);
      for (key, registration) in jobs.iter() {
        let mut trigger = lock(&registration.trigger);
        match trigger.evaluate(&occurrence) {
          Ok(events) if events.is_empty() => {}
          Ok(events) => {
            if let Err(e) = trigger.rearm(now) {
              error!(job = %key, error = %e, "failed to re-arm trigger");
            }
            for event in events {
              fired.push((
                key.clone(),
                registration.job.clone(),
                registration.queue.clone(),
                event,
              ));
            }
          }
          Err(e) => {
            warn!(job = %key, error = %e, "trigger_rejected");
            report.rejected.push(Rejection {
              job: key.clone(),
              error: e,
            });
          }
        }
      }
    }

    let results = join_all(fired.into_iter().map(|(key, job, queue, event)| async move {
      let request = RunRequest::new(event.payload.clone())
        .with_run_id(new_run_id())
        .with_event(event);
      (key, self.execute(job, queue, request).await)
    }))
    .await;

    for (job, result) in results {
      match result {
        Ok(run) => report.runs.push(run),
        Err(e) => {
          error!(job = %job, error = %e, "dispatch_failed");
          report.failed.push(DispatchFailure { job, error: e });
        }
      }
    }
    report
  }

  /// Dispatch a clock tick.
  pub async fn tick(&self, now: DateTime<Utc>) -> DispatchReport {
    self.dispatch(Occurrence::Tick(now)).await
  }

  /// Dispatch a sent event.
  pub async fn send_event(&self, event: SentEvent) -> DispatchReport {
    self.dispatch(Occurrence::Event(event)).await
  }

  /// Dispatch a webhook delivered by `integration_id`.
  pub async fn webhook(
    &self,
    integration_id: impl Into<String>,
    event: impl Into<String>,
    payload: Value,
  ) -> DispatchReport {
    self
      .dispatch(Occurrence::Webhook {
        integration: integration_id.into(),
        event: event.into(),
        payload,
      })
      .await
  }

  async fn execute(
    &self,
    job: Job,
    queue: Option<Arc<Semaphore>>,
    request: RunRequest,
  ) -> Result<RunResult, ClientError> {
    let run_id = request.run_id.clone().unwrap_or_default();
    let _in_flight = InFlight::enter(&self.in_flight, run_id.clone())
      .ok_or_else(|| ClientError::RunInProgress(run_id.clone()))?;

    let _permit = match &queue {
      Some(queue) => Some(
        queue
          .acquire()
          .await
          .map_err(|_| ClientError::QueueClosed)?,
      ),
      None => None,
    };

    let connections = read(&self.connections).clone();
    let result = self
      .runtime
      .execute(
        &job,
        request.with_connections(connections),
        self.cancel.child_token(),
      )
      .await?;
    Ok(result)
  }

  fn lookup(
    &self,
    id: &str,
    version: Option<&str>,
  ) -> Result<(Job, Option<Arc<Semaphore>>), ClientError> {
    let jobs = read(&self.jobs);
    let registration = match version {
      Some(version) => jobs.get(&JobKey {
        id: id.to_string(),
        version: version.to_string(),
      }),
      None => jobs
        .iter()
        .filter(|(key, _)| key.id == id)
        .filter_map(|(key, r)| Version::parse(&key.version).ok().map(|v| (v, r)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, r)| r),
    };

    registration
      .map(|r| (r.job.clone(), r.queue.clone()))
      .ok_or_else(|| match version {
        Some(version) => ClientError::JobNotFound(format!("{}@{}", id, version)),
        None => ClientError::JobNotFound(id.to_string()),
      })
  }

  fn queue(&self, def: &QueueDef) -> Option<Arc<Semaphore>> {
    let mut queues = lock(&self.queues);
    if let Some(existing) = queues.get(&def.name) {
      return Some(Arc::clone(existing));
    }
    let limit = def.max_concurrent?;
    let semaphore = Arc::new(Semaphore::new(limit as usize));
    queues.insert(def.name.clone(), Arc::clone(&semaphore));
    Some(semaphore)
  }
}

/// Marks a run as executing in this process until dropped.
struct InFlight<'a> {
  runs: &'a Mutex<HashSet<String>>,
  run_id: String,
}

impl<'a> InFlight<'a> {
  fn enter(runs: &'a Mutex<HashSet<String>>, run_id: String) -> Option<Self> {
    lock(runs)
      .insert(run_id.clone())
      .then(|| Self { runs, run_id })
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    lock(self.runs).remove(&self.run_id);
  }
}

fn new_run_id() -> String {
  uuid::Uuid::new_v4().to_string()
}

fn occurrence_kind(occurrence: &Occurrence) -> &'static str {
  match occurrence {
    Occurrence::Tick(_) => "tick",
    Occurrence::Event(_) => "event",
    Occurrence::Webhook { .. } => "webhook",
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
  lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
  lock.write().unwrap_or_else(PoisonError::into_inner)
}
