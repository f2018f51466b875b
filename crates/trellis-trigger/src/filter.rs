//! Event payload filters.
//!
//! A filter mirrors the payload shape. Array leaves list accepted values,
//! nested objects recurse, and any other value must match exactly:
//!
//! ```json
//! { "status": ["paid", "refunded"], "customer": { "tier": ["gold"] } }
//! ```

use serde_json::Value;

/// Whether `payload` satisfies `filter`.
pub fn matches_filter(payload: &Value, filter: &Value) -> bool {
  match filter {
    Value::Object(conditions) => conditions.iter().all(|(key, condition)| {
      payload
        .get(key)
        .is_some_and(|field| matches_condition(field, condition))
    }),
    other => payload == other,
  }
}

fn matches_condition(field: &Value, condition: &Value) -> bool {
  match condition {
    Value::Array(accepted) => accepted.contains(field),
    Value::Object(_) => matches_filter(field, condition),
    exact => field == exact,
  }
}
