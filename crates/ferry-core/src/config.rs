//! Queue configuration.
//!
//! 読み込み順:
//! 1. デフォルト値
//! 2. JSON ファイル（任意）
//! 3. 環境変数 `FERRY_*` による上書き
//! 4. `validate()`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where task records live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local, lost on exit.
    #[default]
    Memory,

    /// Embedded sled database at `path`. Single process only: sled locks the directory.
    Sled { path: PathBuf },

    /// SQLite database file (WAL) at `path`. Several processes may open it at once.
    Sqlite { path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("environment variable {name}={value:?} is not a valid value")]
    InvalidEnv { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of workers. 0 is allowed: tasks are accepted but never run.
    pub concurrency: usize,

    pub store: StoreConfig,

    /// How long an idle worker waits before polling the store again.
    pub poll_interval_ms: u64,

    /// Period of the cleanup + stats loop.
    pub maintenance_interval_secs: u64,

    /// Tasks older than this are deleted by the maintenance loop.
    pub retention_days: u32,

    /// Default grace period for in-flight tasks on `stop`.
    pub shutdown_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            store: StoreConfig::Memory,
            poll_interval_ms: 500,
            maintenance_interval_secs: 60,
            retention_days: 7,
            shutdown_timeout_secs: 30,
        }
    }
}

impl QueueConfig {
    /// Defaults, optionally overlaid by a JSON file, then by the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_env_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FERRY_*` overrides read through `lookup`.
    ///
    /// Variables:
    /// - `FERRY_CONCURRENCY`
    /// - `FERRY_STORE_PATH`: switches to a persistent store at that path
    /// - `FERRY_STORE_BACKEND`: `sqlite` (default) or `sled` for `FERRY_STORE_PATH`
    /// - `FERRY_POLL_INTERVAL_MS`
    /// - `FERRY_MAINTENANCE_INTERVAL_SECS`
    /// - `FERRY_RETENTION_DAYS`
    /// - `FERRY_SHUTDOWN_TIMEOUT_SECS`
    pub fn apply_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            match lookup(name) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv { name, value }),
            }
        }

        if let Some(v) = parsed(&lookup, "FERRY_CONCURRENCY")? {
            self.concurrency = v;
        }
        if let Some(path) = lookup("FERRY_STORE_PATH").filter(|p| !p.is_empty()) {
            let backend = lookup("FERRY_STORE_BACKEND");
            self.store = match backend.as_deref().map(str::trim) {
                None | Some("") | Some("sqlite") => StoreConfig::Sqlite { path: path.into() },
                Some("sled") => StoreConfig::Sled { path: path.into() },
                Some(other) => {
                    return Err(ConfigError::InvalidEnv {
                        name: "FERRY_STORE_BACKEND",
                        value: other.to_string(),
                    });
                }
            };
        }
        if let Some(v) = parsed(&lookup, "FERRY_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parsed(&lookup, "FERRY_MAINTENANCE_INTERVAL_SECS")? {
            self.maintenance_interval_secs = v;
        }
        if let Some(v) = parsed(&lookup, "FERRY_RETENTION_DAYS")? {
            self.retention_days = v;
        }
        if let Some(v) = parsed(&lookup, "FERRY_SHUTDOWN_TIMEOUT_SECS")? {
            self.shutdown_timeout_secs = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::NotPositive("poll_interval_ms"));
        }
        if self.maintenance_interval_secs == 0 {
            return Err(ConfigError::NotPositive("maintenance_interval_secs"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = QueueConfig::default()
            .apply_env_from(env(&[
                ("FERRY_CONCURRENCY", "8"),
                ("FERRY_STORE_PATH", "/var/lib/ferry"),
                ("FERRY_RETENTION_DAYS", " 14 "),
            ]))
            .unwrap();

        assert_eq!(config.concurrency, 8);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("/var/lib/ferry")
            }
        );
        assert_eq!(config.retention_days, 14);
        assert_eq!(config.shutdown_timeout_secs, 30);
    }

    #[test]
    fn test_store_backend_selection() {
        let sled = QueueConfig::default()
            .apply_env_from(env(&[
                ("FERRY_STORE_PATH", "/var/lib/ferry"),
                ("FERRY_STORE_BACKEND", "sled"),
            ]))
            .unwrap();
        assert_eq!(
            sled.store,
            StoreConfig::Sled {
                path: PathBuf::from("/var/lib/ferry")
            }
        );

        let err = QueueConfig::default()
            .apply_env_from(env(&[
                ("FERRY_STORE_PATH", "/var/lib/ferry"),
                ("FERRY_STORE_BACKEND", "postgres"),
            ]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { name: "FERRY_STORE_BACKEND", .. }
        ));

        // backend alone does not leave the in-memory store
        let memory = QueueConfig::default()
            .apply_env_from(env(&[("FERRY_STORE_BACKEND", "sled")]))
            .unwrap();
        assert_eq!(memory.store, StoreConfig::Memory);
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let err = QueueConfig::default()
            .apply_env_from(env(&[("FERRY_CONCURRENCY", "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { name: "FERRY_CONCURRENCY", .. }
        ));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let config = QueueConfig {
            poll_interval_ms: 0,
            ..QueueConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive("poll_interval_ms"))
        ));

        let zero_workers = QueueConfig {
            concurrency: 0,
            ..QueueConfig::default()
        };
        assert!(zero_workers.validate().is_ok());
    }

    #[test]
    fn test_reads_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"concurrency": 1, "store": {{"sqlite": {{"path": "data/tasks.db"}}}}}}"#)
            .unwrap();

        let config = QueueConfig::from_file(file.path()).unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("data/tasks.db")
            }
        );
        assert_eq!(config.maintenance_interval_secs, 60);
    }

    #[test]
    fn test_unreadable_file_is_an_error() {
        let err = QueueConfig::from_file(Path::new("/nonexistent/ferry.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
