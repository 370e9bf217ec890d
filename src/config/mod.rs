//! Configuration models for the dispatcher, pools and registry.

pub mod pool;
pub mod registry;
pub mod switchyard;

pub use pool::{
    BackpressurePolicy, ConnectionPoolConfig, DispatcherConfig, ObjectPoolConfig,
    WorkerPoolConfig,
};
pub use registry::RegistryConfig;
pub use switchyard::SwitchyardConfig;
