//! Background loop driving a [`Client`].
//!
//! The loop consumes occurrences sent through [`Client::sender`] (and by
//! `io.send_event` inside runs), ticks schedules on a fixed interval and
//! resumes interrupted runs.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::Client;
use crate::error::ClientError;
use crate::report::DispatchReport;

impl Client {
  /// Start the client loop.
  ///
  /// This blocks until the cancellation token is triggered. Cancelling also
  /// interrupts every run still executing and shuts the client down;
  /// interrupted runs are resumed by the next client started over the same
  /// store.
  pub async fn start(
    self: Arc<Self>,
    cancel: CancellationToken,
    tick_every: Duration,
  ) -> Result<(), ClientError> {
    let mut receiver = self
      .receiver
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
      .ok_or(ClientError::AlreadyStarted)?;

    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
      endpoint_id = %self.config().endpoint_id,
      jobs = self.jobs().len(),
      "starting client"
    );

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!(endpoint_id = %self.config().endpoint_id, "client cancelled");
          self.cancel.cancel();
          break;
        }
        _ = ticker.tick() => {
          let client = Arc::clone(&self);
          tokio::spawn(async move {
            let resumed = client.resume_pending().await;
            if !resumed.is_empty() {
              info!(runs = resumed.len(), "resumed interrupted runs");
            }
            log_report("tick", &client.tick(Utc::now()).await);
          });
        }
        occurrence = receiver.recv() => {
          match occurrence {
            Some(occurrence) => {
              let client = Arc::clone(&self);
              tokio::spawn(async move {
                log_report("occurrence", &client.dispatch(occurrence).await);
              });
            }
            None => {
              info!("client channel closed");
              break;
            }
          }
        }
      }
    }

    Ok(())
  }
}

fn log_report(source: &str, report: &DispatchReport) {
  if report.is_empty() {
    return;
  }
  debug!(
    source,
    runs = report.runs.len(),
    rejected = report.rejected.len(),
    failed = report.failed.len(),
    "dispatched"
  );
}
