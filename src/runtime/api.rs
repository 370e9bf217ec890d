//! API-facing snapshot and health models.

use serde::{Deserialize, Serialize};

use crate::core::{ClassStats, ConnectionFactory, ConnectionStats, PoolMetrics, RegistryStats};
use crate::runtime::Switchyard;
use crate::util::now_ms;

/// Point-in-time view of every component's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchyardSnapshot {
    /// When the snapshot was taken (ms since epoch).
    pub taken_at_ms: u128,
    /// One entry per workload class.
    pub dispatcher: Vec<ClassStats>,
    /// String-buffer pool.
    pub buffers: PoolMetrics,
    /// Command registry and its caches.
    pub registry: RegistryStats,
    /// Connection pool, if a database is configured.
    pub database: Option<ConnectionStats>,
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag: the dispatcher runs and the database, if any, answers.
    pub ok: bool,
    /// Whether the dispatcher still accepts work.
    pub dispatcher_running: bool,
    /// Database probe result, if a database is configured.
    pub database: Option<bool>,
}

/// Collect counters from every component.
pub fn snapshot<F: ConnectionFactory>(yard: &Switchyard<F>) -> SwitchyardSnapshot {
    SwitchyardSnapshot {
        taken_at_ms: now_ms(),
        dispatcher: yard.dispatcher().all_stats(),
        buffers: yard.buffers().metrics(),
        registry: yard.registry().stats(),
        database: yard.database().map(|db| db.stats()),
    }
}

/// Probe the dispatcher and the database.
pub fn health<F: ConnectionFactory>(yard: &Switchyard<F>) -> Health {
    let dispatcher_running = !yard.dispatcher().is_shutdown();
    let database = yard.database().map(|db| db.is_healthy());
    Health {
        ok: dispatcher_running && database.unwrap_or(true),
        dispatcher_running,
        database,
    }
}
