//! Root configuration for an assembled runtime.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ConnectionPoolConfig, DispatcherConfig, ObjectPoolConfig, RegistryConfig};
use crate::core::ConfigError;

/// Path of a JSON configuration file.
pub const CONFIG_PATH_VAR: &str = "SWITCHYARD_CONFIG";
/// Overrides `database.url` when set.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

/// Everything needed to build a `Switchyard`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    /// Worker pools per workload class.
    pub dispatcher: DispatcherConfig,
    /// Command registry caches.
    pub registry: RegistryConfig,
    /// Connection pool. `None` runs without a database.
    pub database: Option<ConnectionPoolConfig>,
    /// Shared string-buffer pool.
    pub buffers: ObjectPoolConfig,
}

impl SwitchyardConfig {
    /// Parse from JSON. Missing sections take their defaults.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` on malformed JSON or out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::Invalid(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Load from the environment.
    ///
    /// A `.env` file is loaded first if present. `SWITCHYARD_CONFIG` names a
    /// JSON file; without it the defaults are used. `DATABASE_URL`, when set,
    /// enables the database section and overrides its URL.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` if the named file is unreadable or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => {
                info!(path = %path, "loading configuration file");
                Self::from_file(path)?
            }
            Err(_) => Self::default(),
        };
        if let Ok(url) = std::env::var(DATABASE_URL_VAR) {
            config.database.get_or_insert_with(ConnectionPoolConfig::default).url = url;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` naming the section at fault.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatcher
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("dispatcher: {e}")))?;
        self.registry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("registry: {e}")))?;
        self.buffers
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("buffers: {e}")))?;
        if let Some(database) = &self.database {
            database
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("database: {e}")))?;
        }
        Ok(())
    }
}
