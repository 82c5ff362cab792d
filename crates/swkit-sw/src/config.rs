//! Service worker manager configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use swkit_net::LoaderConfig;

use crate::error::{Result, ServiceWorkerError};
use crate::policy::SecurityPolicy;

/// Configuration for [`crate::ServiceWorkerManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceWorkerConfig {
    /// SQLite database holding the worker table
    pub database_path: PathBuf,

    /// Minimum seconds between remote freshness checks
    pub update_check_interval_secs: u64,

    /// Upper bound for a single runtime dispatch
    pub dispatch_timeout_ms: u64,

    /// Hosts that may serve workers over plain HTTP
    pub trusted_hosts: Vec<String>,

    /// Script loader settings
    pub loader: LoaderConfig,
}

impl Default for ServiceWorkerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("service_workers.db"),
            update_check_interval_secs: 60 * 60 * 24,
            dispatch_timeout_ms: 30_000,
            trusted_hosts: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "::1".to_string(),
            ],
            loader: LoaderConfig::default(),
        }
    }
}

impl ServiceWorkerConfig {
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ServiceWorkerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ServiceWorkerError::Config(
                "database_path must not be empty".to_string(),
            ));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(ServiceWorkerError::Config(
                "dispatch_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_secs)
    }

    pub fn security_policy(&self) -> SecurityPolicy {
        SecurityPolicy::new(self.trusted_hosts.clone())
    }
}
