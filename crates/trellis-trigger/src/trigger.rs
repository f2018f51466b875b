//! Compiled triggers and the registration state machine.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::debug;
use trellis_config::TriggerDef;

use crate::cron::CronSchedule;
use crate::dynamic::DynamicTrigger;
use crate::error::TriggerError;
use crate::filter::matches_filter;
use crate::schema::PayloadSchema;
use crate::types::{Occurrence, TriggerEvent, TriggerState};

/// Shortest accepted interval.
pub const MIN_INTERVAL_SECONDS: u64 = 60;

/// Longest accepted interval (30 days).
pub const MAX_INTERVAL_SECONDS: u64 = 2_592_000;

/// Number of event ids remembered to drop redelivered events.
const RECENT_EVENT_CAPACITY: usize = 1024;

/// Time-based schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
  Cron(CronSchedule),
  Interval(Duration),
}

impl Schedule {
  /// First occurrence strictly after `after`.
  pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Self::Cron(cron) => cron.next_after(after),
      Self::Interval(every) => Some(after + *every),
    }
  }

  /// Latest occurrence in `(since, at]`, counting intervals from `since`.
  pub fn latest_between(&self, since: DateTime<Utc>, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Self::Cron(cron) => cron.latest_between(since, at),
      Self::Interval(every) => {
        let elapsed = (at - since).num_milliseconds();
        let step = every.num_milliseconds();
        if step <= 0 || elapsed < step {
          return None;
        }
        let count = elapsed / step;
        Some(since + Duration::milliseconds(step * count))
      }
    }
  }

  /// The next `count` occurrences after `from`.
  pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
    let mut out = Vec::with_capacity(count);
    let mut cursor = from;
    while out.len() < count {
      match self.next_after(cursor) {
        Some(next) => {
          out.push(next);
          cursor = next;
        }
        None => break,
      }
    }
    out
  }
}

/// A compiled trigger.
#[derive(Debug, Clone)]
pub enum Trigger {
  Scheduled(Schedule),

  Event {
    name: String,
    source: Option<String>,
    schema: Option<PayloadSchema>,
    filter: Option<Value>,
  },

  /// Webhook delivered by an integration, identified by integration id.
  Webhook {
    integration: String,
    event: String,
    schema: Option<PayloadSchema>,
  },

  Dynamic(DynamicTrigger),
}

impl Trigger {
  /// Compile a trigger definition.
  ///
  /// Webhook definitions name an integration alias and must be resolved by
  /// the job that owns them; use [`Trigger::webhook`] for those.
  pub fn compile(def: &TriggerDef) -> Result<Self, TriggerError> {
    match def {
      TriggerDef::Cron { expression } => {
        Ok(Self::Scheduled(Schedule::Cron(CronSchedule::parse(expression)?)))
      }
      TriggerDef::Interval { seconds } => {
        if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(seconds) {
          return Err(TriggerError::InvalidConfig(format!(
            "interval must be between {} and {} seconds, got {}",
            MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS, seconds
          )));
        }
        Ok(Self::Scheduled(Schedule::Interval(Duration::seconds(*seconds as i64))))
      }
      TriggerDef::Event {
        name,
        source,
        schema,
        filter,
      } => {
        if name.trim().is_empty() {
          return Err(TriggerError::InvalidConfig(
            "event trigger requires a name".to_string(),
          ));
        }
        let schema = schema.as_ref().map(PayloadSchema::compile).transpose()?;
        if let Some(filter) = filter {
          if !filter.is_object() {
            return Err(TriggerError::InvalidConfig(
              "event filter must be an object".to_string(),
            ));
          }
        }
        Ok(Self::Event {
          name: name.clone(),
          source: source.clone(),
          schema,
          filter: filter.clone(),
        })
      }
      TriggerDef::Dynamic { id } => {
        if id.trim().is_empty() {
          return Err(TriggerError::InvalidConfig(
            "dynamic trigger requires an id".to_string(),
          ));
        }
        Ok(Self::Dynamic(DynamicTrigger::new(id.clone())))
      }
      TriggerDef::Webhook { integration, .. } => Err(TriggerError::InvalidConfig(format!(
        "webhook trigger for '{}' must be resolved through its integration",
        integration
      ))),
    }
  }

  /// Build a webhook trigger whose payload shape comes from the integration.
  pub fn webhook(
    integration: impl Into<String>,
    event: impl Into<String>,
    schema: Option<Value>,
  ) -> Result<Self, TriggerError> {
    Ok(Self::Webhook {
      integration: integration.into(),
      event: event.into(),
      schema: schema.as_ref().map(PayloadSchema::compile).transpose()?,
    })
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Self::Scheduled(Schedule::Cron(_)) => "cron",
      Self::Scheduled(Schedule::Interval(_)) => "interval",
      Self::Event { .. } => "event",
      Self::Webhook { .. } => "webhook",
      Self::Dynamic(_) => "dynamic",
    }
  }

  /// Schema a run payload must satisfy, if any.
  pub fn payload_schema(&self) -> Option<&PayloadSchema> {
    match self {
      Self::Event { schema, .. } | Self::Webhook { schema, .. } => schema.as_ref(),
      _ => None,
    }
  }

  /// Validate a payload against this trigger's schema.
  pub fn validate(&self, payload: &Value) -> Result<(), TriggerError> {
    match self.payload_schema() {
      Some(schema) => schema.validate(payload).map_err(|violations| {
        TriggerError::Validation {
          trigger: self.label(),
          violations,
        }
      }),
      None => Ok(()),
    }
  }

  fn label(&self) -> String {
    match self {
      Self::Event { name, .. } => name.clone(),
      Self::Webhook {
        integration, event, ..
      } => format!("{}.{}", integration, event),
      Self::Dynamic(dynamic) => dynamic.id().to_string(),
      other => other.kind().to_string(),
    }
  }
}

/// A registered trigger and its evaluation state.
///
/// `Idle → Armed` on [`arm`](Self::arm), `Armed → Fired` when an occurrence
/// qualifies, `Fired → Idle` on [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct ArmedTrigger {
  trigger: Trigger,
  state: TriggerState,
  armed_at: Option<DateTime<Utc>>,
  last_fired: Option<DateTime<Utc>>,
  recent_events: VecDeque<String>,
}

impl ArmedTrigger {
  pub fn new(trigger: Trigger) -> Self {
    Self {
      trigger,
      state: TriggerState::Idle,
      armed_at: None,
      last_fired: None,
      recent_events: VecDeque::new(),
    }
  }

  pub fn trigger(&self) -> &Trigger {
    &self.trigger
  }

  pub fn state(&self) -> TriggerState {
    self.state
  }

  /// When a scheduled trigger last fired.
  pub fn last_fired(&self) -> Option<DateTime<Utc>> {
    self.last_fired
  }

  /// Arm the trigger. Schedules count from the first time it is armed.
  pub fn arm(&mut self, now: DateTime<Utc>) -> Result<(), TriggerError> {
    self.expect_state(TriggerState::Idle)?;
    self.armed_at.get_or_insert(now);
    self.state = TriggerState::Armed;
    Ok(())
  }

  /// Return a fired trigger to idle.
  pub fn reset(&mut self) -> Result<(), TriggerError> {
    self.expect_state(TriggerState::Fired)?;
    self.state = TriggerState::Idle;
    Ok(())
  }

  /// Reset and arm again after the fired runs were dispatched.
  pub fn rearm(&mut self, now: DateTime<Utc>) -> Result<(), TriggerError> {
    self.reset()?;
    self.arm(now)
  }

  /// Evaluate an occurrence.
  ///
  /// Returns the events that should each start one run. A matching event
  /// whose payload fails the schema is rejected with a validation error.
  pub fn evaluate(&mut self, occurrence: &Occurrence) -> Result<Vec<TriggerEvent>, TriggerError> {
    self.expect_state(TriggerState::Armed)?;

    let events = match (&self.trigger, occurrence) {
      (Trigger::Scheduled(schedule), Occurrence::Tick(now)) => {
        let since = self.last_fired.or(self.armed_at).unwrap_or(*now);
        match schedule.latest_between(since, *now) {
          Some(ts) => {
            let event = TriggerEvent {
              event_id: uuid::Uuid::new_v4().to_string(),
              trigger: self.trigger.kind().to_string(),
              name: None,
              source: None,
              payload: json!({
                "ts": ts,
                "last_timestamp": self.last_fired,
              }),
              timestamp: *now,
            };
            self.last_fired = Some(ts);
            vec![event]
          }
          None => Vec::new(),
        }
      }

      (
        Trigger::Event {
          name,
          source,
          filter,
          ..
        },
        Occurrence::Event(sent),
      ) => {
        let qualifies = sent.name == *name
          && source.as_ref().is_none_or(|s| sent.source.as_ref() == Some(s))
          && filter
            .as_ref()
            .is_none_or(|f| matches_filter(&sent.payload, f));

        if !qualifies || self.recent_events.contains(&sent.id) {
          Vec::new()
        } else {
          self.trigger.validate(&sent.payload)?;
          self.remember(&sent.id);
          vec![TriggerEvent {
            event_id: sent.id.clone(),
            trigger: "event".to_string(),
            name: Some(sent.name.clone()),
            source: sent.source.clone(),
            payload: sent.payload.clone(),
            timestamp: sent.timestamp,
          }]
        }
      }

      (
        Trigger::Webhook {
          integration, event, ..
        },
        Occurrence::Webhook {
          integration: delivered_by,
          event: delivered_event,
          payload,
        },
      ) => {
        if integration != delivered_by || event != delivered_event {
          Vec::new()
        } else {
          self.trigger.validate(payload)?;
          vec![TriggerEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            trigger: "webhook".to_string(),
            name: Some(event.clone()),
            source: Some(integration.clone()),
            payload: payload.clone(),
            timestamp: Utc::now(),
          }]
        }
      }

      (Trigger::Dynamic(dynamic), occurrence) => dynamic.evaluate(occurrence),

      _ => Vec::new(),
    };

    if !events.is_empty() {
      debug!(
        trigger = self.trigger.kind(),
        fired = events.len(),
        "trigger fired"
      );
      self.state = TriggerState::Fired;
    }

    Ok(events)
  }

  fn remember(&mut self, event_id: &str) {
    if self.recent_events.len() == RECENT_EVENT_CAPACITY {
      self.recent_events.pop_front();
    }
    self.recent_events.push_back(event_id.to_string());
  }

  fn expect_state(&self, expected: TriggerState) -> Result<(), TriggerError> {
    if self.state == expected {
      Ok(())
    } else {
      Err(TriggerError::InvalidState {
        state: self.state,
        expected,
      })
    }
  }
}
