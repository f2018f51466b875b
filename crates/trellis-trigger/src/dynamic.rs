//! Dynamic triggers: a named trigger whose concrete sub-triggers are
//! registered and removed at runtime.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use trellis_config::TriggerDef;

use crate::error::TriggerError;
use crate::trigger::{ArmedTrigger, Trigger};
use crate::types::{Occurrence, TriggerEvent};

/// Shared handle to a dynamic trigger. Clones observe the same registrations.
#[derive(Debug, Clone)]
pub struct DynamicTrigger {
  id: String,
  subs: Arc<Mutex<BTreeMap<String, ArmedTrigger>>>,
}

impl DynamicTrigger {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      subs: Arc::new(Mutex::new(BTreeMap::new())),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// Register a sub-trigger under `key`, replacing any previous one.
  pub fn register(
    &self,
    key: impl Into<String>,
    def: &TriggerDef,
    now: DateTime<Utc>,
  ) -> Result<(), TriggerError> {
    self.register_trigger(key, Trigger::compile(def)?, now)
  }

  /// Register an already compiled sub-trigger.
  pub fn register_trigger(
    &self,
    key: impl Into<String>,
    trigger: Trigger,
    now: DateTime<Utc>,
  ) -> Result<(), TriggerError> {
    let key = key.into();
    if key.trim().is_empty() {
      return Err(TriggerError::InvalidConfig(
        "sub-trigger key must not be empty".to_string(),
      ));
    }
    if let Trigger::Dynamic(_) = trigger {
      return Err(TriggerError::InvalidConfig(
        "dynamic triggers cannot be nested".to_string(),
      ));
    }

    let mut armed = ArmedTrigger::new(trigger);
    armed.arm(now)?;

    info!(dynamic = %self.id, key = %key, kind = armed.trigger().kind(), "sub-trigger registered");
    self.lock().insert(key, armed);
    Ok(())
  }

  pub fn unregister(&self, key: &str) -> Result<(), TriggerError> {
    match self.lock().remove(key) {
      Some(_) => {
        info!(dynamic = %self.id, key = %key, "sub-trigger removed");
        Ok(())
      }
      None => Err(TriggerError::NotFound(key.to_string())),
    }
  }

  pub fn keys(&self) -> Vec<String> {
    self.lock().keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Evaluate every sub-trigger. Each firing sub-trigger yields its events
  /// tagged with its key and is armed again.
  ///
  /// A sub-trigger that rejects the payload is logged and skipped so it does
  /// not block the others.
  pub(crate) fn evaluate(&self, occurrence: &Occurrence) -> Vec<TriggerEvent> {
    let now = match occurrence {
      Occurrence::Tick(at) => *at,
      Occurrence::Event(sent) => sent.timestamp,
      Occurrence::Webhook { .. } => Utc::now(),
    };

    let mut fired = Vec::new();
    for (key, sub) in self.lock().iter_mut() {
      match sub.evaluate(occurrence) {
        Ok(events) => {
          if events.is_empty() {
            continue;
          }
          fired.extend(events.into_iter().map(|mut event| {
            event.source = Some(key.clone());
            event
          }));
          if let Err(e) = sub.rearm(now) {
            warn!(dynamic = %self.id, key = %key, error = %e, "failed to re-arm sub-trigger");
          }
        }
        Err(e) => {
          warn!(dynamic = %self.id, key = %key, error = %e, "sub-trigger rejected occurrence");
        }
      }
    }
    fired
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ArmedTrigger>> {
    self.subs.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{SentEvent, TriggerState};
  use serde_json::json;

  fn armed_dynamic(id: &str) -> (DynamicTrigger, ArmedTrigger) {
    let dynamic = DynamicTrigger::new(id);
    let mut armed = ArmedTrigger::new(Trigger::Dynamic(dynamic.clone()));
    armed.arm(Utc::now()).unwrap();
    (dynamic, armed)
  }

  #[test]
  fn test_fires_only_registered_subs() {
    let (dynamic, mut armed) = armed_dynamic("repo-watch");

    let push = SentEvent::new("push", json!({"repo": "a"}));
    assert!(armed.evaluate(&Occurrence::Event(push.clone())).unwrap().is_empty());

    dynamic
      .register("repo-a", &TriggerDef::event("push"), Utc::now())
      .unwrap();
    let events = armed.evaluate(&Occurrence::Event(push)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source.as_deref(), Some("repo-a"));
    assert_eq!(armed.state(), TriggerState::Fired);
  }

  #[test]
  fn test_sub_is_rearmed_after_firing() {
    let (dynamic, mut armed) = armed_dynamic("watch");
    dynamic
      .register("k", &TriggerDef::event("ping"), Utc::now())
      .unwrap();

    for _ in 0..2 {
      let events = armed
        .evaluate(&Occurrence::Event(SentEvent::new("ping", json!({}))))
        .unwrap();
      assert_eq!(events.len(), 1);
      armed.rearm(Utc::now()).unwrap();
    }
  }

  #[test]
  fn test_unregister() {
    let dynamic = DynamicTrigger::new("watch");
    dynamic
      .register("a", &TriggerDef::event("x"), Utc::now())
      .unwrap();
    dynamic
      .register("b", &TriggerDef::event("x"), Utc::now())
      .unwrap();
    assert_eq!(dynamic.keys(), vec!["a".to_string(), "b".to_string()]);

    dynamic.unregister("a").unwrap();
    assert_eq!(dynamic.len(), 1);
    assert_eq!(
      dynamic.unregister("a"),
      Err(TriggerError::NotFound("a".to_string()))
    );
  }

  #[test]
  fn test_rejects_nested_dynamic() {
    let dynamic = DynamicTrigger::new("outer");
    let nested = TriggerDef::Dynamic {
      id: "inner".to_string(),
    };
    assert!(dynamic.register("k", &nested, Utc::now()).is_err());
    assert!(dynamic.is_empty());
  }

  #[test]
  fn test_invalid_payload_does_not_block_other_subs() {
    let (dynamic, mut armed) = armed_dynamic("orders");
    let strict = TriggerDef::Event {
      name: "order".to_string(),
      source: None,
      schema: Some(json!({"type": "object", "required": ["sku"]})),
      filter: None,
    };
    dynamic.register("strict", &strict, Utc::now()).unwrap();
    dynamic
      .register("loose", &TriggerDef::event("order"), Utc::now())
      .unwrap();

    let events = armed
      .evaluate(&Occurrence::Event(SentEvent::new("order", json!({}))))
      .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source.as_deref(), Some("loose"));
  }
}
