//! Trellis Client
//!
//! The client is the registry of jobs for one endpoint. Registering a job
//! validates it and arms its trigger; occurrences dispatched to the client
//! start one run per trigger firing. Runs are executed by the
//! [`Runtime`](trellis_runtime::Runtime) over a shared store, so a run
//! interrupted by a timeout, a cancellation or a restart is resumed with its
//! completed tasks replayed.

mod client;
mod error;
mod report;
mod runner;
mod sink;

pub use client::Client;
pub use error::ClientError;
pub use report::{DispatchFailure, DispatchReport, Rejection};
