//! Payload validation against JSON schemas.
//!
//! Schemas are compiled once when a trigger is built and every payload is
//! checked against the compiled form. Violations are reported as
//! `<instance path>: <message>`, with `$` standing for the payload root.

use std::fmt;
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::TriggerError;

/// A JSON schema compiled for validating payloads.
#[derive(Clone)]
pub struct PayloadSchema {
  raw: Value,
  compiled: Arc<JSONSchema>,
}

impl PayloadSchema {
  /// Compile a schema, rejecting anything that is not a valid schema object.
  pub fn compile(schema: &Value) -> Result<Self, TriggerError> {
    if !schema.is_object() {
      return Err(TriggerError::InvalidConfig(
        "schema must be an object".to_string(),
      ));
    }
    let compiled = JSONSchema::compile(schema)
      .map_err(|e| TriggerError::InvalidConfig(format!("invalid schema: {}", e)))?;

    Ok(Self {
      raw: schema.clone(),
      compiled: Arc::new(compiled),
    })
  }

  pub fn as_value(&self) -> &Value {
    &self.raw
  }

  /// Validate a payload, returning every violation found.
  pub fn validate(&self, payload: &Value) -> Result<(), Vec<String>> {
    self.compiled.validate(payload).map_err(|errors| {
      errors
        .map(|error| {
          let path = error.instance_path.to_string();
          let path = if path.is_empty() { "$".to_string() } else { path };
          format!("{}: {}", path, error)
        })
        .collect()
    })
  }
}

impl fmt::Debug for PayloadSchema {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("PayloadSchema").field(&self.raw).finish()
  }
}

impl PartialEq for PayloadSchema {
  fn eq(&self, other: &Self) -> bool {
    self.raw == other.raw
  }
}
