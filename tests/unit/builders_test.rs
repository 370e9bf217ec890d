//! Tests for builder modules

use switchyard::builders::build_switchyard;
use switchyard::config::{ObjectPoolConfig, RegistryConfig, SwitchyardConfig};
use switchyard::core::{AllowAll, BuildError, ConnectionError};

use crate::common::{db_config, small_dispatcher_config, MemFactory};

fn config() -> SwitchyardConfig {
    SwitchyardConfig {
        dispatcher: small_dispatcher_config(1, 8),
        registry: RegistryConfig {
            maintenance_interval_secs: 0,
            ..RegistryConfig::default()
        },
        database: None,
        buffers: ObjectPoolConfig::default(),
    }
}

#[test]
fn test_builder_rejects_invalid_config() {
    let mut cfg = config();
    cfg.dispatcher.general.worker_count = 0;
    let err = build_switchyard(&cfg, MemFactory::new(), AllowAll).unwrap_err();
    assert!(matches!(err, BuildError::Config(_)), "{err}");
}

#[test]
fn test_builder_fails_when_database_unreachable() {
    let factory = MemFactory::new();
    factory.refuse_connections(true);
    let cfg = SwitchyardConfig {
        database: Some(db_config()),
        ..config()
    };
    let err = build_switchyard(&cfg, factory, AllowAll).unwrap_err();
    assert!(matches!(err, BuildError::Connection(ConnectionError::Init(_))), "{err}");
}

#[test]
fn test_builder_without_maintenance_tracks_no_schedules() {
    let yard = build_switchyard(&config(), MemFactory::new(), AllowAll).unwrap();
    assert!(yard.schedules().is_empty());
    assert_eq!(yard.buffers().idle(), ObjectPoolConfig::default().initial_size);
    yard.shutdown(std::time::Duration::from_secs(1));
}
