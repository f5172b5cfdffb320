//! Operator-facing receiver settings.
//!
//! Stored as a JSON file; every field is optional and falls back to its
//! default:
//!
//! ```json
//! {
//!   "bandwidth": 3145728,
//!   "diskCacheThreshold": 16384,
//!   "maxUploadSize": 20971520,
//!   "progressIntervalMs": 250,
//!   "diskCacheDir": "/var/tmp/uploads"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default global bandwidth cap: 3 MiB/s.
pub const DEFAULT_BANDWIDTH: u64 = 3 * 1024 * 1024;

/// Uploads smaller than this stay in memory.
pub const DEFAULT_DISK_CACHE_THRESHOLD: u64 = 16 * 1024;

/// Default request size limit: 20 MiB.
pub const DEFAULT_MAX_UPLOAD_SIZE: i64 = 20 * 1024 * 1024;

/// `max_upload_size` value meaning "no limit". Any negative value works.
pub const NO_SIZE_LIMIT: i64 = -1;

/// Minimum time between two progress notifications for the same file.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 250;

/// Errors raised while loading or validating a [`ReceiverConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Receiver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReceiverConfig {
    /// Global bandwidth cap in bytes per second; `0` disables throttling.
    pub bandwidth: u64,

    /// Size in bytes above which an upload is spooled to disk.
    pub disk_cache_threshold: u64,

    /// Maximum request size in bytes; negative for no limit.
    pub max_upload_size: i64,

    pub progress_interval_ms: u64,

    /// Where spooled uploads go. Defaults to the system temp directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_cache_dir: Option<PathBuf>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bandwidth: DEFAULT_BANDWIDTH,
            disk_cache_threshold: DEFAULT_DISK_CACHE_THRESHOLD,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            disk_cache_dir: None,
        }
    }
}

impl ReceiverConfig {
    /// Reads, parses and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        debug!(path = %path.display(), "receiver config loaded");
        Ok(config)
    }

    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.progress_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "progressIntervalMs must be greater than zero".into(),
            ));
        }
        if let Some(dir) = &self.disk_cache_dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("diskCacheDir is empty".into()));
            }
            if !dir.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "diskCacheDir is not a directory: {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Request size limit, `None` when unlimited.
    pub fn upload_size_limit(&self) -> Option<u64> {
        u64::try_from(self.max_upload_size).ok()
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn disk_cache_location(&self) -> PathBuf {
        self.disk_cache_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn disk_cache_threshold(&self) -> usize {
        usize::try_from(self.disk_cache_threshold).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReceiverConfig::default();
        assert_eq!(config.bandwidth, 3 * 1024 * 1024);
        assert_eq!(config.disk_cache_threshold, 16 * 1024);
        assert_eq!(config.upload_size_limit(), Some(20 * 1024 * 1024));
        assert_eq!(config.progress_interval(), Duration::from_millis(250));
        assert_eq!(config.disk_cache_location(), std::env::temp_dir());
        config.validate().unwrap();
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = ReceiverConfig::from_json("{}").unwrap();
        assert_eq!(config, ReceiverConfig::default());
    }

    #[test]
    fn partial_document_overrides() {
        let config =
            ReceiverConfig::from_json(r#"{"bandwidth":0,"maxUploadSize":-1}"#).unwrap();
        assert_eq!(config.bandwidth, 0);
        assert_eq!(config.upload_size_limit(), None);
        assert_eq!(config.progress_interval_ms, DEFAULT_PROGRESS_INTERVAL_MS);
    }

    #[test]
    fn any_negative_size_means_unlimited() {
        let config = ReceiverConfig {
            max_upload_size: -42,
            ..Default::default()
        };
        assert_eq!(config.upload_size_limit(), None);
    }

    #[test]
    fn rejects_zero_progress_interval() {
        let err = ReceiverConfig::from_json(r#"{"progressIntervalMs":0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_missing_cache_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        let config = ReceiverConfig {
            disk_cache_dir: Some(missing),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_json() {
        assert!(matches!(
            ReceiverConfig::from_json("{bandwidth"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("receiver.json");
        let json = format!(
            r#"{{"diskCacheThreshold":1024,"diskCacheDir":{}}}"#,
            serde_json::to_string(tmp.path()).unwrap()
        );
        std::fs::write(&path, json).unwrap();

        let config = ReceiverConfig::load(&path).unwrap();
        assert_eq!(config.disk_cache_threshold(), 1024);
        assert_eq!(config.disk_cache_location(), tmp.path());
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ReceiverConfig::load(&tmp.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn round_trips_through_json() {
        let config = ReceiverConfig {
            bandwidth: 1000,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"diskCacheThreshold\""));
        assert!(!json.contains("diskCacheDir"));
        assert_eq!(ReceiverConfig::from_json(&json).unwrap(), config);
    }
}
