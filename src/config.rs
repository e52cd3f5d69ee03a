use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Settings for running job commands.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard limit for a shell-mode job
    pub shell_timeout: Duration,
    /// Max characters of stderr kept on a failed shell job
    pub stderr_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell_timeout: Duration::from_secs(300),
            stderr_limit: 300,
        }
    }
}

/// Queue configuration, read once at startup.
///
/// Every key is optional in the JSON file; missing keys take the defaults
/// below. The value is passed into the store, workers and executor by the
/// caller and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub retry_backoff_base: f64,
    pub max_retries: u32,
    pub metrics_enabled: bool,
    /// Seconds between metrics reports
    pub metrics_interval: u64,
    /// Seconds an idle worker sleeps before polling again
    pub worker_poll_interval: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("queue.db"),
            log_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
            retry_backoff_base: 2.0,
            max_retries: 3,
            metrics_enabled: false,
            metrics_interval: 10,
            worker_poll_interval: 2,
        }
    }
}

impl QueueConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults. A file that exists but cannot be
    /// read or parsed is an error: the process should not start on a
    /// configuration it did not understand.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|e| {
            QueueError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
            .map_err(|e| QueueError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.retry_backoff_base.is_finite() || self.retry_backoff_base < 1.0 {
            return Err(QueueError::Config(format!(
                "retry_backoff_base must be >= 1.0, got {}",
                self.retry_backoff_base
            )));
        }
        if self.worker_poll_interval == 0 {
            return Err(QueueError::Config(
                "worker_poll_interval must be positive".to_string(),
            ));
        }
        if self.metrics_interval == 0 {
            return Err(QueueError::Config(
                "metrics_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker_poll_interval)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_default() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.db_path, PathBuf::from("queue.db"));
        assert_eq!(cfg.log_dir, PathBuf::from("logs"));
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.retry_backoff_base, 2.0);
        assert_eq!(cfg.max_retries, 3);
        assert!(!cfg.metrics_enabled);
        assert_eq!(cfg.metrics_interval, 10);
        assert_eq!(cfg.worker_poll_interval, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn executor_config_default() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.shell_timeout, Duration::from_secs(300));
        assert_eq!(cfg.stderr_limit, 300);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = QueueConfig::from_json(r#"{"max_retries": 5, "db_path": "/tmp/q.db"}"#).unwrap();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(cfg.retry_backoff_base, 2.0);
        assert_eq!(cfg.worker_poll_interval, 2);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            QueueConfig::from_json("{not json"),
            Err(QueueError::Config(_))
        ));
        assert!(matches!(
            QueueConfig::from_json(r#"{"max_retries": "three"}"#),
            Err(QueueError::Config(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(QueueConfig::from_json(r#"{"retry_backoff_base": 0.5}"#).is_err());
        assert!(QueueConfig::from_json(r#"{"worker_poll_interval": 0}"#).is_err());
        assert!(QueueConfig::from_json(r#"{"metrics_interval": 0}"#).is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = QueueConfig::load("/nonexistent/dir/config.json").unwrap();
        assert_eq!(cfg, QueueConfig::default());
    }

    #[test]
    fn durations() {
        let cfg = QueueConfig {
            worker_poll_interval: 7,
            metrics_interval: 30,
            ..Default::default()
        };
        assert_eq!(cfg.poll_interval(), Duration::from_secs(7));
        assert_eq!(cfg.metrics_interval(), Duration::from_secs(30));
    }
}
