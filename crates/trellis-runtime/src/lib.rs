//! Trellis Runtime
//!
//! Executes runs of jobs. A run function receives the payload, an [`Io`]
//! handle and the [`RunContext`]; every unit of work it performs goes through
//! [`Io::run_task`], which records the task under its key. Executing the same
//! run again replays recorded results, so a run interrupted by a timeout or a
//! restart resumes where it stopped.
//!
//! Tasks are retried according to their [`RetryPolicy`](trellis_config::RetryPolicy)
//! and may install an onError handler to reclassify errors or request a
//! specific retry time. Tasks nest up to [`MAX_NESTING_DEPTH`] levels.

mod context;
mod error;
mod events;
mod io;
mod job;
mod retry;
mod runtime;
mod task;

pub use context::{Credentials, RunContext};
pub use error::RunError;
pub use events::{
  ChannelNotifier, EventSink, ExecutionEvent, ExecutionNotifier, LogLevel, NoopNotifier,
};
pub use io::{Io, MAX_NESTING_DEPTH};
pub use job::{IntegrationRef, Job, JobError, JobKey, RunFn, validate_definition};
pub use retry::backoff_delay;
pub use runtime::{RunRequest, RunResult, Runtime, RuntimeConfig};
pub use task::{DisplayProperty, OnErrorFn, OnErrorOutcome, TaskError, TaskHandle, TaskOptions};
