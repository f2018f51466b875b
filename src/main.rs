use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trellis_config::{ClientConfig, JobDef};
use trellis_runtime::validate_definition;
use trellis_store::{SqliteStore, Store};
use trellis_trigger::Trigger;

/// Trellis - durable, resumable background jobs
#[derive(Parser)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: $TRELLIS_DATA_DIR or ~/.trellis)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Validate a job definition
  Validate {
    /// Path to the job definition (JSON)
    job_file: PathBuf,
  },

  /// Check a payload read from stdin against a job's trigger
  CheckPayload {
    /// Path to the job definition (JSON)
    job_file: PathBuf,
  },

  /// Print the next occurrences of a scheduled job
  Schedule {
    /// Path to the job definition (JSON)
    job_file: PathBuf,

    #[arg(long, default_value_t = 5)]
    count: usize,

    /// Start of the window (RFC 3339, default: now)
    #[arg(long)]
    from: Option<DateTime<Utc>>,
  },

  /// Inspect recorded runs
  Runs {
    #[command(subcommand)]
    target: RunsTarget,
  },

  /// Print the resolved client configuration
  Config,
}

#[derive(Subcommand)]
enum RunsTarget {
  /// List the runs of a job, most recent first
  List {
    #[arg(long)]
    job: String,
  },

  /// Show a run and its tasks
  Show { run_id: String },
}

fn main() -> Result<()> {
  let _ = dotenvy::dotenv();
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();
  let config = ClientConfig::from_env().context("failed to load configuration")?;

  match cli.command {
    Some(Commands::Validate { job_file }) => validate(&job_file),
    Some(Commands::CheckPayload { job_file }) => check_payload(&job_file),
    Some(Commands::Schedule {
      job_file,
      count,
      from,
    }) => schedule(&job_file, count, from.unwrap_or_else(Utc::now)),
    Some(Commands::Runs { target }) => {
      let data_dir = data_dir(cli.data_dir, &config)?;
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async { runs(target, &data_dir).await })
    }
    Some(Commands::Config) => {
      println!("{:#?}", config);
      println!("resolved data dir: {}", data_dir(cli.data_dir, &config)?.display());
      Ok(())
    }
    None => {
      println!("trellis - use --help to see available commands");
      Ok(())
    }
  }
}

/// Run database inside the data dir.
const DB_FILE: &str = "trellis.db";

fn data_dir(flag: Option<PathBuf>, config: &ClientConfig) -> Result<PathBuf> {
  if let Some(dir) = flag.or_else(|| config.data_dir.clone()) {
    return Ok(dir);
  }
  let home = dirs::home_dir().context("could not determine home directory")?;
  Ok(home.join(".trellis"))
}

fn load_job(path: &Path) -> Result<JobDef> {
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read job file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse job file: {}", path.display()))
}

fn validate(path: &Path) -> Result<()> {
  let def = load_job(path)?;
  let version = validate_definition(&def).context("invalid job definition")?;
  println!(
    "{}@{} ({} trigger) is valid",
    def.id,
    version,
    def.trigger.kind()
  );
  for (alias, id) in &def.integrations {
    println!("  integration {} -> {}", alias, id);
  }
  Ok(())
}

fn check_payload(path: &Path) -> Result<()> {
  let def = load_job(path)?;
  let trigger = Trigger::compile(&def.trigger)
    .with_context(|| format!("cannot check payloads for the {} trigger", def.trigger.kind()))?;
  let payload = read_payload_from_stdin()?;

  trigger.validate(&payload).context("payload rejected")?;
  println!("payload accepted by {}", def.id);
  Ok(())
}

fn schedule(path: &Path, count: usize, from: DateTime<Utc>) -> Result<()> {
  let def = load_job(path)?;
  let trigger = Trigger::compile(&def.trigger).context("invalid trigger")?;
  let Trigger::Scheduled(schedule) = trigger else {
    bail!("job '{}' has a {} trigger, not a schedule", def.id, def.trigger.kind());
  };

  for ts in schedule.upcoming(from, count) {
    println!("{}", ts.to_rfc3339());
  }
  Ok(())
}

async fn runs(target: RunsTarget, data_dir: &Path) -> Result<()> {
  let db_path = data_dir.join(DB_FILE);
  let store = SqliteStore::connect_existing(&db_path)
    .await
    .with_context(|| format!("failed to open run store: {}", db_path.display()))?;

  let Some(store) = store else {
    match target {
      RunsTarget::List { job } => eprintln!("no runs recorded for {}", job),
      RunsTarget::Show { run_id } => bail!("run '{}' not found", run_id),
    }
    return Ok(());
  };

  match target {
    RunsTarget::List { job } => {
      let runs = store.list_runs(&job).await?;
      if runs.is_empty() {
        eprintln!("no runs recorded for {}", job);
      }
      for run in runs {
        println!(
          "{}  {}@{}  {:?}  {}",
          run.run_id,
          run.job_id,
          run.job_version,
          run.status,
          run.started_at.to_rfc3339()
        );
      }
    }
    RunsTarget::Show { run_id } => {
      let run = store
        .get_run(&run_id)
        .await?
        .with_context(|| format!("run '{}' not found", run_id))?;
      let tasks = store.list_tasks(&run_id).await?;
      let output = serde_json::json!({
        "run": run,
        "tasks": tasks,
      });
      println!("{}", serde_json::to_string_pretty(&output)?);
    }
  }

  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(serde_json::json!({}));
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read payload from stdin")?;

  if input.trim().is_empty() {
    Ok(serde_json::json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
  }
}
