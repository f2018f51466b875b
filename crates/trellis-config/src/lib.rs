//! Trellis Config
//!
//! This crate contains the serializable configuration types for Trellis.
//! These types describe jobs before they are bound to a run function and
//! registered with a client.
//!
//! Configuration can be loaded from:
//! - JSON files (via the CLI, e.g. `trellis validate job.json`)
//! - Environment variables (`ClientConfig::from_env`)
//!
//! The runtime takes these definitions, validates them, and compiles triggers
//! into evaluators.

mod client;
mod integration;
mod job;
mod retry;
mod trigger;
mod version;

pub use client::{ClientConfig, ConfigError, DEFAULT_API_URL, DEFAULT_ENDPOINT_ID};
pub use integration::{EventSpec, IntegrationMetadata};
pub use job::{JobDef, QueueDef};
pub use retry::RetryPolicy;
pub use trigger::TriggerDef;
pub use version::{Version, VersionError};
