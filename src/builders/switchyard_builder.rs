//! Build a [`Switchyard`] from a [`SwitchyardConfig`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::SwitchyardConfig;
use crate::core::{
    BuildError, CapabilityChecker, CommandRegistry, ConnectionFactory, ConnectionPoolManager,
    ObjectPool, TaskDispatcher,
};
use crate::runtime::Switchyard;

/// Connection maintenance never runs more often than this.
const MIN_CONNECTION_MAINTENANCE: Duration = Duration::from_secs(1);
/// Connection maintenance period when the idle timeout is disabled.
const DEFAULT_CONNECTION_MAINTENANCE: Duration = Duration::from_secs(30);

/// Construct every component once, wire maintenance schedules, and connect
/// to the database if one is configured.
///
/// `factory` is only used when `cfg.database` is set.
///
/// # Errors
///
/// - `BuildError::Config` for invalid configuration or a thread that cannot start
/// - `BuildError::Connection` if the database fails its startup health check;
///   the dispatcher started so far is shut down before returning
pub fn build_switchyard<F, C>(cfg: &SwitchyardConfig, factory: F, checker: C) -> Result<Switchyard<F>, BuildError>
where
    F: ConnectionFactory,
    C: CapabilityChecker,
{
    cfg.validate()?;

    let dispatcher = TaskDispatcher::new(cfg.dispatcher.clone())?;
    let buffers = match ObjectPool::<String>::string_buffers(cfg.buffers.initial_size, cfg.buffers.max_size) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            dispatcher.shutdown(Duration::ZERO);
            return Err(e.into());
        }
    };
    let registry = Arc::new(CommandRegistry::new(&cfg.registry, checker));

    let database = match &cfg.database {
        Some(db) => {
            let manager = ConnectionPoolManager::new(factory);
            if let Err(e) = manager.connect(db.clone()) {
                dispatcher.shutdown(Duration::ZERO);
                return Err(e.into());
            }
            Some(Arc::new(manager))
        }
        None => None,
    };

    let mut yard = Switchyard::from_parts(dispatcher, registry, buffers, database);

    if let Some(period) = cfg.registry.maintenance_interval() {
        let handle = yard.registry().schedule_maintenance(yard.dispatcher(), period);
        yard.track_schedule(handle);
    }
    if let (Some(manager), Some(db)) = (yard.database().cloned(), &cfg.database) {
        let period = if db.idle_timeout_ms == 0 {
            DEFAULT_CONNECTION_MAINTENANCE
        } else {
            (db.idle_timeout() / 2).max(MIN_CONNECTION_MAINTENANCE)
        };
        let handle = manager.schedule_maintenance(yard.dispatcher(), period);
        yard.track_schedule(handle);
    }

    info!(
        database = cfg.database.is_some(),
        buffers = cfg.buffers.max_size,
        "switchyard assembled"
    );
    Ok(yard)
}
