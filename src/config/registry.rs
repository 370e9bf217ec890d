//! Command registry cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounds and lifetimes of the registry's lookup caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Resolved handlers kept hot.
    pub handler_cache_capacity: usize,
    /// How long a resolved handler stays cached.
    pub handler_cache_ttl_secs: u64,
    /// Capability verdicts kept hot.
    pub capability_cache_capacity: usize,
    /// How long an allow or deny verdict stays cached.
    pub capability_cache_ttl_secs: u64,
    /// Lock stripes per cache.
    pub cache_shards: usize,
    /// Period of the expired-entry sweep. Zero disables it.
    pub maintenance_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            handler_cache_capacity: 256,
            handler_cache_ttl_secs: 300,
            capability_cache_capacity: 10_000,
            capability_cache_ttl_secs: 600,
            cache_shards: 16,
            maintenance_interval_secs: 60,
        }
    }
}

impl RegistryConfig {
    /// Handler cache TTL as a `Duration`.
    #[must_use]
    pub const fn handler_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.handler_cache_ttl_secs)
    }

    /// Capability cache TTL as a `Duration`.
    #[must_use]
    pub const fn capability_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.capability_cache_ttl_secs)
    }

    /// Sweep period, if maintenance is enabled.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Option<Duration> {
        if self.maintenance_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.maintenance_interval_secs))
        }
    }

    /// Validate cache bounds.
    ///
    /// # Errors
    ///
    /// A message naming the first zero bound.
    pub fn validate(&self) -> Result<(), String> {
        if self.handler_cache_capacity == 0 {
            return Err("handler_cache_capacity must be greater than 0".into());
        }
        if self.capability_cache_capacity == 0 {
            return Err("capability_cache_capacity must be greater than 0".into());
        }
        if self.cache_shards == 0 {
            return Err("cache_shards must be greater than 0".into());
        }
        Ok(())
    }
}
