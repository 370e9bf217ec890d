//! One instance of every component, shared by `Arc`.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::core::{
    CommandRegistry, ConnectionFactory, ConnectionPoolManager, ObjectPool, ScheduleHandle,
    ShutdownReport, TaskDispatcher,
};

/// The substrate handed to request handlers.
///
/// Built once at startup, usually by [`crate::builders::build_switchyard`].
/// Clone the `Arc`s out of it to give collaborators only what they need.
pub struct Switchyard<F: ConnectionFactory> {
    dispatcher: TaskDispatcher,
    registry: Arc<CommandRegistry>,
    buffers: Arc<ObjectPool<String>>,
    database: Option<Arc<ConnectionPoolManager<F>>>,
    schedules: Vec<ScheduleHandle>,
}

impl<F: ConnectionFactory> Switchyard<F> {
    /// Assemble from components built elsewhere.
    #[must_use]
    pub const fn from_parts(
        dispatcher: TaskDispatcher,
        registry: Arc<CommandRegistry>,
        buffers: Arc<ObjectPool<String>>,
        database: Option<Arc<ConnectionPoolManager<F>>>,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            buffers,
            database,
            schedules: Vec::new(),
        }
    }

    /// Cancel `handle` when the runtime shuts down.
    pub fn track_schedule(&mut self, handle: ScheduleHandle) {
        self.schedules.push(handle);
    }

    /// The task dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// The command registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Scratch string buffers.
    #[must_use]
    pub const fn buffers(&self) -> &Arc<ObjectPool<String>> {
        &self.buffers
    }

    /// The connection pool, if a database is configured.
    #[must_use]
    pub const fn database(&self) -> Option<&Arc<ConnectionPoolManager<F>>> {
        self.database.as_ref()
    }

    /// Maintenance schedules owned by the runtime.
    #[must_use]
    pub fn schedules(&self) -> &[ScheduleHandle] {
        &self.schedules
    }

    /// Stop maintenance, drain the dispatcher for up to `grace`, then close
    /// the database pool.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        for schedule in &self.schedules {
            schedule.cancel();
        }
        let report = self.dispatcher.shutdown(grace);
        if let Some(database) = &self.database {
            database.disconnect();
        }
        info!(
            drained = report.drained,
            cancelled = report.cancelled,
            "switchyard shut down"
        );
        report
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Switchyard<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchyard")
            .field("dispatcher", &self.dispatcher)
            .field("registry", &self.registry)
            .field("buffers", &self.buffers)
            .field("database", &self.database)
            .field("schedules", &self.schedules.len())
            .finish()
    }
}
