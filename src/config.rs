//! Configuration for the local database, remote endpoint and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PersistenceError, Result};

/// Remote endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the sync service (no trailing path)
    pub base_url: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Retries for a single request answered with 429 Too Many Requests
    pub max_retries: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.runsync.app".to_string(),
            request_timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SQLite database path for the local store
    pub db_path: String,
    /// Fixed delay before a failed pass is attempted again (milliseconds)
    pub retry_interval_ms: u64,
    pub remote: RemoteConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: "runsync.db".to_string(),
            retry_interval_ms: 30_000,
            remote: RemoteConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|e| PersistenceError::config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(PersistenceError::config("db_path must not be empty"));
        }
        if self.retry_interval_ms == 0 {
            return Err(PersistenceError::config(
                "retry_interval_ms must be greater than zero",
            ));
        }
        let url = self.remote.base_url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(PersistenceError::config(format!(
                "remote.base_url must be an http(s) URL, got '{}'",
                self.remote.base_url
            )));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_interval(), Duration::from_secs(30));
        assert_eq!(config.remote.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            SyncConfig::from_json(r#"{"db_path": "/data/runs.db", "remote": {"max_retries": 5}}"#)
                .unwrap();
        assert_eq!(config.db_path, "/data/runs.db");
        assert_eq!(config.retry_interval_ms, 30_000);
        assert_eq!(config.remote.max_retries, 5);
        assert_eq!(config.remote.base_url, RemoteConfig::default().base_url);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            SyncConfig::from_json(r#"{"retry_interval_ms": 0}"#),
            Err(PersistenceError::Config { .. })
        ));
        assert!(matches!(
            SyncConfig::from_json(r#"{"remote": {"base_url": "ftp://example.com"}}"#),
            Err(PersistenceError::Config { .. })
        ));
        assert!(matches!(
            SyncConfig::from_json("not json"),
            Err(PersistenceError::Config { .. })
        ));
    }
}
