//! Core components: dispatcher, pools, registry and caches.

pub mod cache;
pub mod connection_pool;
pub mod dispatcher;
pub mod error;
pub mod object_pool;
pub mod registry;

pub use cache::{CacheStats, CachedEntry, TtlCache};
pub use connection_pool::{
    ConnectionFactory, ConnectionPoolManager, ConnectionStats, MaintenanceReport,
    PooledConnection, RawConnection,
};
pub use dispatcher::{
    BatchReport, ClassStats, Handle, ScheduleHandle, ShutdownReport, TaskDispatcher, TaskState,
    WorkloadClass,
};
pub use error::{AppResult, BuildError, ConfigError, ConnectionError, TaskError};
pub use object_pool::{ObjectPool, PoolMetrics, PooledObject};
pub use registry::{
    AllowAll, CapabilityChecker, CommandDescriptor, CommandEvent, CommandHandler,
    CommandMetadata, CommandRegistry, CommandUsage, DispatchOutcome, ExecutionContext, Hook,
    RegistryStats, ADMIN_CAPABILITY,
};
