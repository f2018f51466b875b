use std::fmt;
use std::path::PathBuf;

/// Default URL of the orchestration API.
pub const DEFAULT_API_URL: &str = "http://localhost:3030";

/// Default endpoint identity when none is configured.
pub const DEFAULT_ENDPOINT_ID: &str = "trellis";

/// Error produced while loading client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("invalid value for {key}: {message}")]
  InvalidValue { key: String, message: String },
}

/// Client configuration.
///
/// The API key and URL are passed through untouched; they identify this
/// endpoint to the orchestration service and are never parsed here.
#[derive(Clone)]
pub struct ClientConfig {
  pub endpoint_id: String,
  pub api_key: Option<String>,
  pub api_url: String,
  pub organization_id: Option<String>,
  /// Runs exceeding this duration are interrupted and resumed later.
  pub max_run_duration_ms: Option<u64>,
  pub data_dir: Option<PathBuf>,
}

impl ClientConfig {
  pub fn new(endpoint_id: impl Into<String>) -> Self {
    Self {
      endpoint_id: endpoint_id.into(),
      api_key: None,
      api_url: DEFAULT_API_URL.to_string(),
      organization_id: None,
      max_run_duration_ms: None,
      data_dir: None,
    }
  }

  /// Load configuration from process environment variables.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Load configuration from an arbitrary key lookup.
  ///
  /// Blank values are treated as unset.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let endpoint_id = get("TRELLIS_ENDPOINT_ID").unwrap_or_else(|| DEFAULT_ENDPOINT_ID.to_string());
    let api_key = get("TRELLIS_API_KEY");
    let api_url = get("TRELLIS_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let organization_id = get("TRELLIS_ORG_ID");

    let max_run_duration_ms = match get("TRELLIS_MAX_RUN_MS") {
      Some(raw) => Some(raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
        key: "TRELLIS_MAX_RUN_MS".to_string(),
        message: e.to_string(),
      })?),
      None => None,
    };

    let data_dir = get("TRELLIS_DATA_DIR").map(PathBuf::from);

    Ok(Self {
      endpoint_id,
      api_key,
      api_url,
      organization_id,
      max_run_duration_ms,
      data_dir,
    })
  }
}

impl fmt::Debug for ClientConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ClientConfig")
      .field("endpoint_id", &self.endpoint_id)
      .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
      .field("api_url", &self.api_url)
      .field("organization_id", &self.organization_id)
      .field("max_run_duration_ms", &self.max_run_duration_ms)
      .field("data_dir", &self.data_dir)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key| map.get(key).cloned()
  }

  #[test]
  fn test_defaults() {
    let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
    assert_eq!(config.endpoint_id, DEFAULT_ENDPOINT_ID);
    assert_eq!(config.api_url, DEFAULT_API_URL);
    assert!(config.api_key.is_none());
    assert!(config.max_run_duration_ms.is_none());
  }

  #[test]
  fn test_values_and_blank_handling() {
    let config = ClientConfig::from_lookup(lookup(&[
      ("TRELLIS_ENDPOINT_ID", "billing"),
      ("TRELLIS_API_KEY", "tr_dev_123"),
      ("TRELLIS_API_URL", "https://orchestrator.internal/"),
      ("TRELLIS_ORG_ID", "  "),
      ("TRELLIS_MAX_RUN_MS", "30000"),
    ]))
    .unwrap();

    assert_eq!(config.endpoint_id, "billing");
    assert_eq!(config.api_key.as_deref(), Some("tr_dev_123"));
    assert_eq!(config.api_url, "https://orchestrator.internal/");
    assert!(config.organization_id.is_none());
    assert_eq!(config.max_run_duration_ms, Some(30_000));
  }

  #[test]
  fn test_api_url_is_kept_verbatim() {
    for url in ["http://api.example.com/", "https://api.example.com/v1//", "http://localhost:3030"] {
      let config = ClientConfig::from_lookup(lookup(&[("TRELLIS_API_URL", url)])).unwrap();
      assert_eq!(config.api_url, url);
    }
  }

  #[test]
  fn test_invalid_duration() {
    let err = ClientConfig::from_lookup(lookup(&[("TRELLIS_MAX_RUN_MS", "soon")])).unwrap_err();
    assert!(err.to_string().contains("TRELLIS_MAX_RUN_MS"));
  }

  #[test]
  fn test_debug_redacts_api_key() {
    let mut config = ClientConfig::new("ep");
    config.api_key = Some("secret-key".to_string());
    let debug = format!("{:?}", config);
    assert!(!debug.contains("secret-key"));
  }
}
