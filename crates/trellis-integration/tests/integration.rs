use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use trellis_config::{EventSpec, JobDef, RetryPolicy, TriggerDef};
use trellis_integration::{AuthenticatedTask, Integration, IntegrationError, TaskInit};
use trellis_runtime::{
  Credentials, Io, IntegrationRef, Job, OnErrorOutcome, RunError, RunRequest, RunResult, Runtime,
  RuntimeConfig, TaskError, TaskHandle, TaskOptions,
};
use trellis_store::{MemoryStore, RunStatus, TaskStatus};

struct MailClient {
  token: String,
  sent: Mutex<Vec<Value>>,
  failures_left: AtomicU32,
}

impl MailClient {
  fn new(token: &str) -> Self {
    Self {
      token: token.to_string(),
      sent: Mutex::new(Vec::new()),
      failures_left: AtomicU32::new(0),
    }
  }

  fn failing(token: &str, failures: u32) -> Self {
    let client = Self::new(token);
    client.failures_left.store(failures, Ordering::SeqCst);
    client
  }

  fn send(&self, message: Value) -> Result<Value, TaskError> {
    if self
      .failures_left
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
    {
      return Err(TaskError::provider("mail", Some(503), "{\"code\":\"unavailable\"}"));
    }
    let mut sent = self.sent.lock().unwrap();
    sent.push(message);
    Ok(json!({"id": format!("email_{}", sent.len()), "token": self.token}))
  }
}

struct SendEmail;

#[async_trait]
impl AuthenticatedTask<MailClient> for SendEmail {
  fn init(&self, params: &Value) -> TaskInit {
    TaskInit::new("Send Email", params.clone())
      .with_icon("mail")
      .with_property("To", params["to"].as_str().unwrap_or_default())
      .with_retry(
        RetryPolicy::standard()
          .with_limit(3)
          .with_timeouts(1, 5)
          .with_randomize(false),
      )
  }

  async fn run(
    &self,
    params: Value,
    client: Arc<MailClient>,
    _task: TaskHandle,
    _io: Io,
    _auth: Option<Credentials>,
  ) -> Result<Value, TaskError> {
    client.send(params)
  }
}

/// Looks up the recipient in a nested task before sending.
struct SendToUser;

#[async_trait]
impl AuthenticatedTask<MailClient> for SendToUser {
  fn init(&self, params: &Value) -> TaskInit {
    TaskInit::new("Send To User", params.clone())
  }

  async fn run(
    &self,
    params: Value,
    client: Arc<MailClient>,
    _task: TaskHandle,
    io: Io,
    auth: Option<Credentials>,
  ) -> Result<Value, TaskError> {
    let user = params["user"].as_str().unwrap_or_default().to_string();
    let to: String = io
      .run_task("lookup", TaskOptions::new("Lookup user"), |_, _| {
        let user = user.clone();
        async move { Ok(format!("{}@example.com", user)) }
      })
      .await?;
    let mut sent = client.send(json!({"to": to}))?;
    sent["scopes"] = json!(auth.map(|a| a.scopes).unwrap_or_default());
    Ok(sent)
  }

  fn on_error(&self, error: &TaskError, _task: &TaskHandle) -> OnErrorOutcome {
    OnErrorOutcome::Replace(TaskError::fatal(format!("send-to-user: {}", error)))
  }
}

fn local_mail(client: MailClient) -> Arc<Integration<MailClient>> {
  Arc::new(
    Integration::builder("mail", "Mail")
      .client(client)
      .task("send-email", SendEmail)
      .task("send-to-user", SendToUser)
      .event(EventSpec {
        name: "bounced".to_string(),
        title: Some("Email bounced".to_string()),
        schema: json!({"type": "object", "required": ["email"]}),
      })
      .on_error(|error, _| match error {
        TaskError::Provider {
          status, retryable, ..
        } => OnErrorOutcome::Replace(TaskError::Provider {
          provider: "mail".to_string(),
          status: *status,
          message: "mail provider unavailable".to_string(),
          retryable: *retryable,
        }),
        _ => OnErrorOutcome::Unhandled,
      })
      .build()
      .unwrap(),
  )
}

fn delegated_mail() -> Arc<Integration<MailClient>> {
  Arc::new(
    Integration::builder("mail", "Mail")
      .client_factory(|creds: &Credentials| Ok(MailClient::new(&creds.access_token)))
      .task("send-email", SendEmail)
      .task("send-to-user", SendToUser)
      .build()
      .unwrap(),
  )
}

fn job_with(mail: Arc<Integration<MailClient>>, task: &'static str, params: Value) -> Job {
  let def = JobDef::new("notify", "Notify", "1.0.0", TriggerDef::cron("0 9 * * *"));
  let handle: Arc<dyn IntegrationRef> = mail.clone();
  Job::new(def, move |_, io, _| {
    let mail = mail.clone();
    let params = params.clone();
    async move { mail.run_task(&io, task, task, params).await }
  })
  .with_integration("mail", handle)
}

async fn execute(job: &Job, connections: HashMap<String, Credentials>) -> Result<RunResult, RunError> {
  Runtime::new(RuntimeConfig::default(), Arc::new(MemoryStore::new()))
    .execute(
      job,
      RunRequest::new(json!({})).with_connections(connections),
      CancellationToken::new(),
    )
    .await
}

#[test]
fn test_builder_requires_exactly_one_client_source() {
  let missing = Integration::<MailClient>::builder("mail", "Mail").build();
  assert!(matches!(missing, Err(IntegrationError::MissingClient { .. })));

  let both = Integration::builder("mail", "Mail")
    .client(MailClient::new("t"))
    .client_factory(|_| Ok(MailClient::new("t")))
    .build();
  assert!(matches!(both, Err(IntegrationError::ConflictingClient { .. })));

  let duplicate = Integration::builder("mail", "Mail")
    .client(MailClient::new("t"))
    .task("send-email", SendEmail)
    .task("send-email", SendEmail)
    .build();
  assert!(matches!(duplicate, Err(IntegrationError::DuplicateTask { .. })));
}

#[test]
fn test_exposes_metadata_and_events() {
  let mail = local_mail(MailClient::new("t"));
  assert_eq!(mail.metadata().name, "Mail");
  assert!(!mail.is_delegated());
  assert!(mail.event("bounced").is_some());
  assert_eq!(
    mail.task_names().collect::<Vec<_>>(),
    vec!["send-email", "send-to-user"]
  );
}

#[tokio::test]
async fn test_local_client_task() {
  let mail = local_mail(MailClient::new("local-token"));
  let job = job_with(
    mail,
    "send-email",
    json!({"to": "ada@example.com", "subject": "Daily report", "text": "All green"}),
  );

  let result = execute(&job, HashMap::new()).await.unwrap();
  assert_eq!(result.status, RunStatus::Succeeded);
  assert_eq!(result.output, Some(json!({"id": "email_1", "token": "local-token"})));

  let task = &result.tasks[0];
  assert_eq!(task.key, "send-email");
  assert_eq!(task.name, "Send Email");
  assert_eq!(task.display.0["icon"], json!("mail"));
  assert_eq!(task.display.0["properties"][0]["text"], json!("ada@example.com"));
}

#[tokio::test]
async fn test_shared_on_error_normalizes_provider_errors() {
  let mail = local_mail(MailClient::failing("t", 10));
  let job = job_with(mail, "send-email", json!({"to": "ada@example.com"}));

  let result = execute(&job, HashMap::new()).await.unwrap();
  assert_eq!(result.status, RunStatus::Failed);

  let task = &result.tasks[0];
  assert_eq!(task.status, TaskStatus::Failed);
  assert_eq!(task.attempt, 4);
  assert_eq!(
    task.error.as_ref().unwrap().0["message"],
    json!("mail provider unavailable")
  );
}

#[tokio::test]
async fn test_transient_provider_errors_are_retried() {
  let mail = local_mail(MailClient::failing("t", 2));
  let job = job_with(mail.clone(), "send-email", json!({"to": "ada@example.com"}));

  let result = execute(&job, HashMap::new()).await.unwrap();
  assert_eq!(result.status, RunStatus::Succeeded);
  assert_eq!(result.tasks[0].attempt, 3);
}

#[tokio::test]
async fn test_task_on_error_runs_before_shared_handler() {
  let mail = local_mail(MailClient::failing("t", 1));
  let job = job_with(mail, "send-to-user", json!({"user": "ada"}));

  let result = execute(&job, HashMap::new()).await.unwrap();
  assert_eq!(result.status, RunStatus::Failed);

  let task = result.tasks.iter().find(|t| t.key == "send-to-user").unwrap();
  let message = task.error.as_ref().unwrap().0["message"].as_str().unwrap().to_string();
  assert!(message.starts_with("send-to-user:"));
  // The task's replacement is fatal, so no retry happened
  assert_eq!(task.attempt, 1);
}

#[tokio::test]
async fn test_delegated_auth_requires_credentials() {
  let job = job_with(delegated_mail(), "send-email", json!({"to": "ada@example.com"}));

  let result = execute(&job, HashMap::new()).await.unwrap();
  assert_eq!(result.status, RunStatus::Failed);
  assert!(result.error.unwrap().contains("no connection"));
  assert!(result.tasks.is_empty());
}

#[tokio::test]
async fn test_delegated_auth_builds_client_from_credentials() {
  let job = job_with(delegated_mail(), "send-to-user", json!({"user": "grace"}));
  let mut connections = HashMap::new();
  connections.insert(
    "mail".to_string(),
    Credentials::new("oauth-token").with_scopes(["send"]),
  );

  let result = execute(&job, connections).await.unwrap();
  assert_eq!(result.status, RunStatus::Succeeded);
  assert_eq!(
    result.output,
    Some(json!({"id": "email_1", "token": "oauth-token", "scopes": ["send"]}))
  );

  let keys: Vec<&str> = result.tasks.iter().map(|t| t.key.as_str()).collect();
  assert_eq!(keys, vec!["send-to-user", "send-to-user/lookup"]);
}
