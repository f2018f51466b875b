//! Trellis Integration
//!
//! An integration wraps a third-party API client and exposes its operations
//! as tasks. The client is either a single pre-authenticated instance (local
//! auth) or built per run from connection credentials by a factory
//! (delegated auth).
//!
//! Each operation implements [`AuthenticatedTask`]: `init` derives display
//! metadata from the params without doing any I/O, `run` performs the call.
//! Invoking an operation goes through [`Integration::run_task`], so it is
//! recorded, retried and resumable like any other task.

mod error;
mod integration;
mod task;

pub use error::IntegrationError;
pub use integration::{ClientFactory, ClientSource, Integration, IntegrationBuilder};
pub use task::{AuthenticatedTask, TaskInit};
