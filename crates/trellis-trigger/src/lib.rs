//! Trellis Trigger
//!
//! Triggers decide when a job should start a run and what payload it gets.
//! A [`TriggerDef`](trellis_config::TriggerDef) is compiled into a
//! [`Trigger`], wrapped in an [`ArmedTrigger`] once registered, and then
//! evaluated against [`Occurrence`]s: clock ticks, sent events and webhook
//! deliveries.
//!
//! Evaluation is deterministic: the same trigger state and occurrence always
//! produce the same decision.

mod cron;
mod dynamic;
mod error;
mod filter;
mod schema;
mod trigger;
mod types;

pub use cron::CronSchedule;
pub use dynamic::DynamicTrigger;
pub use error::TriggerError;
pub use filter::matches_filter;
pub use schema::PayloadSchema;
pub use trigger::{ArmedTrigger, MAX_INTERVAL_SECONDS, MIN_INTERVAL_SECONDS, Schedule, Trigger};
pub use types::{Occurrence, SentEvent, TriggerEvent, TriggerState};
