//! Tests for error types

use std::time::Duration;

use switchyard::core::{BuildError, ConfigError, ConnectionError, TaskError, WorkloadClass};

#[test]
fn test_initial_exceeds_max_error() {
    let err = ConfigError::InitialExceedsMax { initial: 10, max: 4 };
    assert_eq!(format!("{}", err), "initial size 10 exceeds max size 4");
}

#[test]
fn test_acquire_error_reports_wait() {
    let err = ConnectionError::Acquire {
        reason: "all 3 connections are in use".into(),
        waited: Duration::from_millis(200),
    };
    assert_eq!(
        format!("{}", err),
        "failed to acquire connection after 200ms: all 3 connections are in use"
    );
}

#[test]
fn test_rejected_error_names_class() {
    let err = TaskError::Rejected(WorkloadClass::Database);
    assert_eq!(format!("{}", err), "database queue is full");
}

#[test]
fn test_timeout_error() {
    let err = TaskError::TimedOut(Duration::from_millis(100));
    assert!(err.is_timeout());
    assert!(!err.is_cancelled());
    assert_eq!(format!("{}", err), "task timed out after 100ms");
}

#[test]
fn test_failed_error_keeps_source_chain() {
    let source = anyhow::anyhow!("connection reset").context("loading profile");
    let err = TaskError::Failed(source);
    assert_eq!(format!("{}", err), "task failed: loading profile: connection reset");
    assert_eq!(err.source_error().unwrap().to_string(), "loading profile");
    assert!(TaskError::Cancelled.source_error().is_none());
}

#[test]
fn test_build_error_is_transparent() {
    let err: BuildError = ConnectionError::NotConfigured.into();
    assert_eq!(format!("{}", err), "connection pool is not configured");
    let err: BuildError = ConfigError::Invalid("buffers: max_size must be greater than 0".into()).into();
    assert!(matches!(err, BuildError::Config(_)));
}
