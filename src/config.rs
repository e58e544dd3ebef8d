//! Runtime configuration: `~/.docgraph/config.json`.
//!
//! Every field has a serde default, so an empty object (or a missing file) is
//! a valid configuration. `DOCGRAPH_DB_PATH` overrides `databasePath`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::{CoreDb, DbError};
use crate::retry::RetryPolicy;

/// Environment variable that overrides the configured database path.
pub const DB_PATH_ENV: &str = "DOCGRAPH_DB_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    /// Absolute path to the SQLite file. Defaults to `~/.docgraph/docgraph.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Page size for audit queries that do not pass a limit.
    #[serde(default = "default_query_limit")]
    pub default_query_limit: u32,
    /// Larger requested limits are clamped to this.
    #[serde(default = "default_max_query_limit")]
    pub max_query_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_query_limit() -> u32 {
    100
}

fn default_max_query_limit() -> u32 {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    1_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: cfg.max_attempts,
            initial_backoff_ms: cfg.initial_backoff_ms,
            max_backoff_ms: cfg.max_backoff_ms,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            retry: RetryConfig::default(),
            default_query_limit: default_query_limit(),
            max_query_limit: default_max_query_limit(),
        }
    }
}

impl CoreConfig {
    /// Database path after applying the env override and the home-dir default.
    pub fn resolved_database_path(&self) -> Result<PathBuf, DbError> {
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        match &self.database_path {
            Some(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
            _ => CoreDb::default_db_path(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// Resolve the limit for one audit page.
    ///
    /// `None` uses the default page size; zero is rejected; anything above
    /// `max_query_limit` is clamped.
    pub fn effective_limit(&self, requested: Option<u32>) -> Result<u32, String> {
        match requested {
            None => Ok(self.default_query_limit.min(self.max_query_limit)),
            Some(0) => Err("limit must be at least 1".to_string()),
            Some(n) => Ok(n.min(self.max_query_limit)),
        }
    }
}

/// Get the canonical config file path (~/.docgraph/config.json)
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".docgraph").join("config.json"))
}

/// Load configuration from ~/.docgraph/config.json, falling back to defaults
/// when the file does not exist.
pub fn load_config() -> Result<CoreConfig, String> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<CoreConfig, String> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(CoreConfig::default());
    }

    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
    let config: CoreConfig =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;

    if config.max_query_limit == 0 {
        return Err("maxQueryLimit must be at least 1".to_string());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_yields_defaults() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert_eq!(config.default_query_limit, 100);
        assert_eq!(config.max_query_limit, 1_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_camel_case_fields() {
        let config: CoreConfig = serde_json::from_str(
            r#"{"databasePath": "/tmp/x.db", "busyTimeoutMs": 10, "retry": {"maxAttempts": 7}}"#,
        )
        .unwrap();
        assert_eq!(config.database_path.as_deref(), Some("/tmp/x.db"));
        assert_eq!(config.busy_timeout_ms, 10);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.initial_backoff_ms, 50);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.max_query_limit, 1_000);
    }

    #[test]
    fn test_load_rejects_malformed_and_zero_max() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{not json").unwrap();
        assert!(load_config_from(&bad).unwrap_err().contains("parse"));

        let zero = dir.path().join("zero.json");
        fs::write(&zero, r#"{"maxQueryLimit": 0}"#).unwrap();
        assert!(load_config_from(&zero).is_err());
    }

    #[test]
    fn test_effective_limit() {
        let config = CoreConfig::default();
        assert_eq!(config.effective_limit(None).unwrap(), 100);
        assert_eq!(config.effective_limit(Some(25)).unwrap(), 25);
        assert_eq!(config.effective_limit(Some(50_000)).unwrap(), 1_000);
        assert!(config.effective_limit(Some(0)).is_err());
    }

    #[test]
    fn test_explicit_database_path_used() {
        // Env override is process-global; only assert the configured branch
        // when it is not set.
        if std::env::var(DB_PATH_ENV).is_ok() {
            return;
        }
        let config = CoreConfig {
            database_path: Some("/var/lib/docgraph/main.db".into()),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_database_path().unwrap(),
            PathBuf::from("/var/lib/docgraph/main.db")
        );
    }
}
