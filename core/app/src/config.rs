//! Client configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use metapm_cache::CacheConfig;
use metapm_common::{Error, Result};
use metapm_sync::SyncConfig;

/// Default service origin.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Default local database file.
pub const DEFAULT_DATABASE_PATH: &str = "metapm-offline.db";

/// Offline client configuration, read from a JSON file.
///
/// Every field is optional in the file; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service origin. Request paths are absolute, so any path here is ignored.
    pub base_url: String,
    pub database_path: PathBuf,
    /// Path probed with HEAD for reachability.
    pub health_path: String,
    pub probe_interval_secs: u64,
    /// Upper bound on every remote call, including probes.
    pub request_timeout_secs: u64,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            health_path: "/health".to_string(),
            probe_interval_secs: 30,
            request_timeout_secs: 30,
            sync: SyncConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Read and validate a configuration file.
    ///
    /// # Errors
    /// - `Config` if the file cannot be read, parsed or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_json(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Parse and validate configuration JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Check field values.
    ///
    /// # Errors
    /// - `Config` for a base URL that is not an absolute http(s) URL, a zero
    ///   probe interval, a zero timeout, a health path not starting with `/`,
    ///   or `max_attempts` of zero
    pub fn validate(&self) -> Result<()> {
        let trimmed = self.base_url.trim();
        if trimmed.is_empty() {
            return Err(Error::Config("base_url must not be empty".to_string()));
        }
        let scheme = trimmed.split("://").next().unwrap_or_default();
        if !trimmed.contains("://") || !matches!(scheme, "http" | "https") {
            return Err(Error::Config(format!(
                "base_url '{}' must be an http(s) URL",
                self.base_url
            )));
        }
        if !self.health_path.starts_with('/') {
            return Err(Error::Config(format!(
                "health_path '{}' must start with '/'",
                self.health_path
            )));
        }
        if self.probe_interval_secs == 0 {
            return Err(Error::Config("probe_interval_secs must be positive".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".to_string()));
        }
        if self.sync.max_attempts == Some(0) {
            return Err(Error::Config("sync.max_attempts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
