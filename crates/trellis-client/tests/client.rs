use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use trellis_client::{Client, ClientError};
use trellis_config::{ClientConfig, JobDef, TriggerDef};
use trellis_integration::{AuthenticatedTask, Integration, TaskInit};
use trellis_runtime::{
  Credentials, IntegrationRef, Io, Job, JobError, RunError, TaskError, TaskHandle, TaskOptions,
};
use trellis_store::{MemoryStore, RunStatus, Store};
use trellis_trigger::SentEvent;

fn client() -> Client {
  Client::new(ClientConfig::new("test"), Arc::new(MemoryStore::new()))
}

fn echo(def: JobDef) -> Job {
  Job::new(def, |payload, _, _| async move { Ok(payload) })
}

fn on_event(id: &str, event: &str) -> JobDef {
  JobDef::new(id, id, "1.0.0", TriggerDef::event(event))
}

async fn wait_for_run(store: &Arc<dyn Store>, job_id: &str, status: RunStatus) -> Value {
  for _ in 0..100 {
    let runs = store.list_runs(job_id).await.unwrap();
    if let Some(run) = runs.iter().find(|r| r.status == status) {
      return run.output.clone().map(|o| o.0).unwrap_or(Value::Null);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("no {:?} run of '{}'", status, job_id);
}

#[test]
fn test_register_rejects_invalid_jobs() {
  let client = client();

  let bad_cron = echo(JobDef::new("a", "A", "1.0.0", TriggerDef::cron("61 * * * *")));
  assert!(matches!(
    client.register(bad_cron),
    Err(ClientError::Configuration(JobError::InvalidTrigger { .. }))
  ));

  let short_interval = echo(JobDef::new("b", "B", "1.0.0", TriggerDef::interval(30)));
  assert!(matches!(
    client.register(short_interval),
    Err(ClientError::Configuration(JobError::InvalidTrigger { .. }))
  ));

  let unknown_alias = echo(JobDef::new(
    "c",
    "C",
    "1.0.0",
    TriggerDef::Webhook {
      integration: "gh".to_string(),
      event: "push".to_string(),
    },
  ));
  assert!(matches!(
    client.register(unknown_alias),
    Err(ClientError::Configuration(JobError::UnknownIntegration { .. }))
  ));

  let bad_version = echo(JobDef::new("d", "D", "v1", TriggerDef::cron("@daily")));
  assert!(matches!(
    client.register(bad_version),
    Err(ClientError::Configuration(JobError::InvalidVersion { .. }))
  ));

  assert!(client.jobs().is_empty());
}

#[tokio::test]
async fn test_duplicate_registration_and_latest_version() {
  let client = client();
  let versioned = |version: &str| {
    Job::new(
      JobDef::new("report", "Report", version, TriggerDef::event("report.requested")),
      |_, _, ctx| async move { Ok(json!(ctx.job_version)) },
    )
  };

  client.register(versioned("1.9.0")).unwrap();
  client.register(versioned("1.10.0")).unwrap();
  assert!(matches!(
    client.register(versioned("1.9.0")),
    Err(ClientError::AlreadyRegistered(_))
  ));
  assert_eq!(client.jobs().len(), 2);
  assert!(client.job("report", "1.9.0").is_some());

  let latest = client.invoke("report", None, json!({})).await.unwrap();
  assert_eq!(latest.output, Some(json!("1.10.0")));

  let pinned = client.invoke("report", Some("1.9.0"), json!({})).await.unwrap();
  assert_eq!(pinned.output, Some(json!("1.9.0")));

  assert!(matches!(
    client.invoke("missing", None, json!({})).await,
    Err(ClientError::JobNotFound(_))
  ));
}

struct Mailbox {
  sent: Mutex<Vec<Value>>,
}

struct SendEmail;

#[async_trait]
impl AuthenticatedTask<Mailbox> for SendEmail {
  fn init(&self, params: &Value) -> TaskInit {
    TaskInit::new("Send Email", params.clone())
      .with_property("To", params["to"].as_str().unwrap_or_default())
  }

  async fn run(
    &self,
    params: Value,
    client: Arc<Mailbox>,
    _task: TaskHandle,
    _io: Io,
    _auth: Option<Credentials>,
  ) -> Result<Value, TaskError> {
    let mut sent = client.sent.lock().unwrap();
    sent.push(params);
    Ok(json!({"id": format!("email_{}", sent.len())}))
  }
}

#[tokio::test]
async fn test_cron_job_sends_email_once_per_occurrence() {
  let local = Arc::new(
    Integration::builder("resend", "Resend")
      .client(Mailbox {
        sent: Mutex::new(Vec::new()),
      })
      .task("send-email", SendEmail)
      .build()
      .unwrap(),
  );

  let handle: Arc<dyn IntegrationRef> = local.clone();
  let job = Job::new(
    JobDef::new("daily-report", "Daily report", "1.0.0", TriggerDef::cron("0 9 * * *")),
    {
      let local = Arc::clone(&local);
      move |payload, io, _| {
        let local = Arc::clone(&local);
        async move {
          local
            .run_task(
              &io,
              "send-email",
              "send-email",
              json!({
                "to": "ops@example.com",
                "subject": "Daily report",
                "text": format!("Report for {}", payload["ts"]),
              }),
            )
            .await
        }
      }
    },
  )
  .with_integration("email", handle);

  let client = client();
  client.register(job).unwrap();

  let now = Utc::now() + chrono::Duration::days(2);
  let report = client.tick(now).await;
  assert_eq!(report.runs.len(), 1);

  let run = &report.runs[0];
  assert_eq!(run.status, RunStatus::Succeeded);
  assert_eq!(run.output, Some(json!({"id": "email_1"})));
  assert_eq!(run.tasks.len(), 1);
  assert_eq!(run.tasks[0].key, "send-email");
  assert_eq!(run.tasks[0].params.0["to"], json!("ops@example.com"));

  // Same instant again: the occurrence was already handled
  assert!(client.tick(now).await.is_empty());
}

#[tokio::test]
async fn test_event_payload_is_validated_before_run() {
  let client = client();
  client
    .register(echo(JobDef::new(
      "welcome",
      "Welcome",
      "1.0.0",
      TriggerDef::Event {
        name: "user.created".to_string(),
        source: None,
        schema: Some(json!({
          "type": "object",
          "properties": {"email": {"type": "string"}},
          "required": ["email"],
        })),
        filter: None,
      },
    )))
    .unwrap();

  let rejected = client
    .send_event(SentEvent::new("user.created", json!({"name": "Ada"})))
    .await;
  assert!(rejected.runs.is_empty());
  assert_eq!(rejected.rejected.len(), 1);
  assert!(client.store().list_runs("welcome").await.unwrap().is_empty());

  let accepted = client
    .send_event(SentEvent::new("user.created", json!({"email": "ada@example.com"})))
    .await;
  assert_eq!(accepted.runs.len(), 1);
  assert_eq!(
    accepted.runs[0].output,
    Some(json!({"email": "ada@example.com"}))
  );

  let other = client
    .send_event(SentEvent::new("user.deleted", json!({})))
    .await;
  assert!(other.is_empty());
}

fn tracked(def: JobDef, active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Job {
  Job::new(def, move |_, _, _| {
    let active = Arc::clone(&active);
    let peak = Arc::clone(&peak);
    async move {
      let now = active.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(50)).await;
      active.fetch_sub(1, Ordering::SeqCst);
      Ok(Value::Null)
    }
  })
}

#[tokio::test]
async fn test_queue_limits_concurrent_runs() {
  let client = client();
  let active = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));

  for id in ["a", "b", "c"] {
    let def = on_event(id, "go").with_queue("serial", Some(1));
    client
      .register(tracked(def, Arc::clone(&active), Arc::clone(&peak)))
      .unwrap();
  }

  let report = client.send_event(SentEvent::new("go", json!({}))).await;
  assert_eq!(report.runs.len(), 3);
  assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_jobs_without_queue_limit_run_together() {
  let client = client();
  let active = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));

  for id in ["a", "b"] {
    let def = on_event(id, "go").with_queue("wide", None);
    client
      .register(tracked(def, Arc::clone(&active), Arc::clone(&peak)))
      .unwrap();
  }

  let report = client.send_event(SentEvent::new("go", json!({}))).await;
  assert_eq!(report.runs.len(), 2);
  assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dynamic_trigger_sub_triggers() {
  let client = client();
  client
    .register(Job::new(
      JobDef::new(
        "on-push",
        "On push",
        "1.0.0",
        TriggerDef::Dynamic {
          id: "repo-push".to_string(),
        },
      ),
      |_, _, ctx| async move { Ok(json!(ctx.event.and_then(|e| e.source))) },
    ))
    .unwrap();

  let push = |repo: &str| SentEvent::new("push", json!({"repo": repo}));
  assert!(client.send_event(push("acme/api")).await.is_empty());

  let dynamic = client.dynamic_trigger("repo-push");
  dynamic
    .register(
      "acme/api",
      &TriggerDef::Event {
        name: "push".to_string(),
        source: None,
        schema: None,
        filter: Some(json!({"repo": ["acme/api"]})),
      },
      Utc::now(),
    )
    .unwrap();

  let report = client.send_event(push("acme/api")).await;
  assert_eq!(report.runs.len(), 1);
  assert_eq!(report.runs[0].output, Some(json!("acme/api")));
  assert!(client.send_event(push("acme/web")).await.is_empty());

  client.dynamic_trigger("repo-push").unregister("acme/api").unwrap();
  assert!(client.send_event(push("acme/api")).await.is_empty());
}

#[tokio::test]
async fn test_connect_injects_credentials() {
  let client = client();
  client
    .register(Job::new(on_event("whoami", "whoami"), |_, _, ctx| async move {
      Ok(json!(ctx.connection("github").map(|c| c.access_token.clone())))
    }))
    .unwrap();

  let anonymous = client.invoke("whoami", None, json!({})).await.unwrap();
  assert_eq!(anonymous.output, Some(Value::Null));

  client.connect("github", Credentials::new("gho_token"));
  let connected = client.invoke("whoami", None, json!({})).await.unwrap();
  assert_eq!(connected.output, Some(json!("gho_token")));
}

/// A job whose first execution outlives the maximum run duration.
fn slow_job(executed: Arc<AtomicUsize>) -> Job {
  let first = Arc::new(AtomicBool::new(true));
  Job::new(on_event("slow", "slow"), move |_, io, _| {
    let executed = Arc::clone(&executed);
    let first = Arc::clone(&first);
    async move {
      let count: usize = io
        .run_task("prepare", TaskOptions::new("Prepare"), |_, _| {
          let executed = Arc::clone(&executed);
          async move { Ok(executed.fetch_add(1, Ordering::SeqCst) + 1) }
        })
        .await?;
      if first.swap(false, Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(500)).await;
      }
      Ok::<_, RunError>(json!(count))
    }
  })
}

fn interrupting_client() -> Client {
  let mut config = ClientConfig::new("test");
  config.max_run_duration_ms = Some(100);
  Client::new(config, Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn test_resume_interrupted_run() {
  let client = interrupting_client();
  let executed = Arc::new(AtomicUsize::new(0));
  client.register(slow_job(Arc::clone(&executed))).unwrap();

  let interrupted = client.invoke("slow", None, json!({})).await.unwrap();
  assert_eq!(interrupted.status, RunStatus::Interrupted);

  let resumed = client.resume(&interrupted.run_id).await.unwrap();
  assert_eq!(resumed.status, RunStatus::Succeeded);
  assert_eq!(resumed.output, Some(json!(1)));
  assert_eq!(executed.load(Ordering::SeqCst), 1);

  assert!(matches!(
    client.resume("no-such-run").await,
    Err(ClientError::RunNotFound(_))
  ));
}

#[tokio::test]
async fn test_loop_resumes_interrupted_runs() {
  let client = Arc::new(interrupting_client());
  let executed = Arc::new(AtomicUsize::new(0));
  client.register(slow_job(Arc::clone(&executed))).unwrap();

  let interrupted = client.invoke("slow", None, json!({})).await.unwrap();
  assert_eq!(interrupted.status, RunStatus::Interrupted);

  let cancel = CancellationToken::new();
  let handle = tokio::spawn(
    Arc::clone(&client).start(cancel.clone(), Duration::from_millis(20)),
  );

  let output = wait_for_run(client.store(), "slow", RunStatus::Succeeded).await;
  assert_eq!(output, json!(1));

  cancel.cancel();
  handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_events_sent_from_runs_are_dispatched() {
  let client = Arc::new(client());
  client
    .register(Job::new(on_event("checkout", "order.paid"), |payload, io, _| async move {
      let sent = io
        .send_event("notify-shipping", "order.shipped", json!({"order": payload["order"]}))
        .await?;
      Ok(json!(sent.id))
    }))
    .unwrap();
  client.register(echo(on_event("shipping", "order.shipped"))).unwrap();

  let cancel = CancellationToken::new();
  let handle = tokio::spawn(
    Arc::clone(&client).start(cancel.clone(), Duration::from_secs(60)),
  );

  client
    .sender()
    .send(trellis_trigger::Occurrence::Event(SentEvent::new(
      "order.paid",
      json!({"order": 42}),
    )))
    .await
    .unwrap();

  let shipped = wait_for_run(client.store(), "shipping", RunStatus::Succeeded).await;
  assert_eq!(shipped, json!({"order": 42}));

  assert!(matches!(
    Arc::clone(&client)
      .start(CancellationToken::new(), Duration::from_secs(60))
      .await,
    Err(ClientError::AlreadyStarted)
  ));

  cancel.cancel();
  handle.await.unwrap().unwrap();
}
