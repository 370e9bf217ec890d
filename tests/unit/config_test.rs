//! Tests for configuration loading and validation

use std::time::Duration;

use switchyard::config::{
    BackpressurePolicy, ConnectionPoolConfig, ObjectPoolConfig, RegistryConfig, SwitchyardConfig,
};
use switchyard::core::{ConfigError, WorkloadClass};

#[test]
fn test_default_config_is_valid() {
    let config = SwitchyardConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.database.is_none());
    assert_eq!(config.dispatcher.for_class(WorkloadClass::Scheduled).worker_count, 2);
}

#[test]
fn test_partial_json_fills_defaults() {
    let config = SwitchyardConfig::from_json_str(
        r#"{
            "dispatcher": { "network": { "worker_count": 3, "backpressure": "reject" } },
            "database": { "url": "mem://app", "max_total": 4 }
        }"#,
    )
    .unwrap();

    assert_eq!(config.dispatcher.network.worker_count, 3);
    assert_eq!(config.dispatcher.network.backpressure, BackpressurePolicy::Reject);
    assert_eq!(config.dispatcher.general.backpressure, BackpressurePolicy::CallerRuns);
    let database = config.database.unwrap();
    assert_eq!(database.max_total, 4);
    assert_eq!(database.min_idle, 2);
    assert_eq!(database.acquire_timeout(), Duration::from_secs(30));
    assert_eq!(database.health_check_query, "SELECT 1");
}

#[test]
fn test_malformed_json_is_invalid() {
    let err = SwitchyardConfig::from_json_str("{ not json").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.starts_with("malformed configuration")));
}

#[test]
fn test_validation_names_section() {
    let err = SwitchyardConfig::from_json_str(r#"{ "buffers": { "initial_size": 9, "max_size": 4 } }"#)
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.starts_with("buffers:")), "{err}");

    let err = SwitchyardConfig::from_json_str(r#"{ "database": { "url": "" } }"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.starts_with("database:")), "{err}");
}

#[test]
fn test_from_file_round_trip() {
    let path = std::env::temp_dir().join(format!("switchyard-{}.json", uuid::Uuid::new_v4()));
    let config = SwitchyardConfig {
        database: Some(ConnectionPoolConfig::new("mem://file").with_max_total(5)),
        buffers: ObjectPoolConfig {
            initial_size: 1,
            max_size: 3,
        },
        ..SwitchyardConfig::default()
    };
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = SwitchyardConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);
    std::fs::remove_file(&path).unwrap();

    assert!(SwitchyardConfig::from_file(&path).is_err());
}

#[test]
fn test_from_env_applies_database_url() {
    std::env::remove_var(switchyard::config::switchyard::CONFIG_PATH_VAR);
    std::env::set_var(switchyard::config::switchyard::DATABASE_URL_VAR, "mem://from-env");
    let config = SwitchyardConfig::from_env().unwrap();
    std::env::remove_var(switchyard::config::switchyard::DATABASE_URL_VAR);

    assert_eq!(config.database.unwrap().url, "mem://from-env");
}

#[test]
fn test_registry_maintenance_can_be_disabled() {
    let config = RegistryConfig {
        maintenance_interval_secs: 0,
        ..RegistryConfig::default()
    };
    assert_eq!(config.maintenance_interval(), None);
    assert_eq!(
        RegistryConfig::default().maintenance_interval(),
        Some(Duration::from_secs(60))
    );
}
