//! Integration tests for ConnectionPoolManager
//!
//! These tests validate:
//! - Startup failure when the database is unreachable or unhealthy
//! - Bounded leasing, waiting and timeouts
//! - Reinitialization after disconnect
//! - Statement cache hits and whole-cache clearing
//! - Lifetime, idle-timeout and validate-on-acquire retirement

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use switchyard::core::{ConnectionError, ConnectionPoolManager, TaskDispatcher};

use common::{db_config, small_dispatcher_config, MemFactory};

fn connected(factory: &MemFactory) -> ConnectionPoolManager<MemFactory> {
    let manager = ConnectionPoolManager::new(factory.clone());
    manager.connect(db_config()).unwrap();
    manager
}

// ============================================================================
// STARTUP
// ============================================================================

#[test]
fn test_connect_warms_min_idle() {
    let factory = MemFactory::new();
    let manager = connected(&factory);
    assert!(manager.is_connected());
    let stats = manager.stats();
    assert!(stats.connected);
    assert_eq!(stats.total, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(factory.connects(), 1);
}

#[test]
fn test_refused_connection_fails_startup() {
    let factory = MemFactory::new();
    factory.refuse_connections(true);
    let manager = ConnectionPoolManager::new(factory);
    let err = manager.connect(db_config()).unwrap_err();
    assert!(matches!(err, ConnectionError::Init(ref msg) if msg.contains("connection refused")), "{err}");
    assert!(!manager.is_connected());
}

#[test]
fn test_failed_health_check_fails_startup() {
    let factory = MemFactory::new();
    factory.set_down(true);
    let manager = ConnectionPoolManager::new(factory.clone());
    assert!(matches!(manager.connect(db_config()), Err(ConnectionError::Init(_))));
    assert_eq!(manager.stats().total, 0);
    assert_eq!(factory.closes(), factory.connects());
}

#[test]
fn test_invalid_config_fails_startup() {
    let manager = ConnectionPoolManager::new(MemFactory::new());
    let err = manager.connect(db_config().with_max_total(0)).unwrap_err();
    assert!(matches!(err, ConnectionError::Init(_)));
}

#[test]
fn test_acquire_before_connect_is_not_configured() {
    let manager = ConnectionPoolManager::new(MemFactory::new());
    assert!(matches!(manager.acquire(), Err(ConnectionError::NotConfigured)));
    assert_eq!(manager.stats().acquire_errors, 1);
}

// ============================================================================
// LEASING
// ============================================================================

#[test]
fn test_leases_are_bounded_and_timed() {
    let factory = MemFactory::new();
    let manager = connected(&factory);
    let held: Vec<_> = (0..3).map(|_| manager.acquire().unwrap()).collect();
    assert_eq!(manager.stats().active, 3);

    let started = Instant::now();
    let err = manager.acquire().unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(matches!(err, ConnectionError::Acquire { .. }));

    drop(held);
    let stats = manager.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 3);
    assert_eq!(stats.acquires, 3);
    assert_eq!(stats.acquire_errors, 1);
    assert!(stats.average_acquire_time().is_some());
}

#[test]
fn test_waiter_gets_released_connection() {
    let manager = Arc::new(ConnectionPoolManager::new(MemFactory::new()));
    manager
        .connect(
            db_config()
                .with_max_total(1)
                .with_acquire_timeout(Duration::from_secs(2)),
        )
        .unwrap();

    let held = manager.acquire().unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        drop(held);
    });

    let started = Instant::now();
    let conn = manager.acquire().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(!conn.is_closed());
    releaser.join().unwrap();
    assert_eq!(manager.stats().total, 1);
}

#[test]
fn test_concurrent_leases_never_exceed_max_total() {
    let manager = Arc::new(connected(&MemFactory::new()));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let mut leased = 0;
                for _ in 0..50 {
                    if let Ok(mut conn) = manager.acquire() {
                        let stats = manager.stats();
                        assert!(stats.total <= 3, "{stats:?}");
                        assert!(stats.active <= 3, "{stats:?}");
                        thread::sleep(Duration::from_micros(200));
                        conn.close();
                        leased += 1;
                    }
                }
                leased
            })
        })
        .collect();
    let leased: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert!(leased > 0);
    assert_eq!(manager.stats().active, 0);
    assert!(manager.stats().total <= 3);
}

#[test]
fn test_retired_connection_is_destroyed_on_release() {
    let factory = MemFactory::new();
    let manager = connected(&factory);
    let mut conn = manager.acquire().unwrap();
    conn.retire();
    conn.close();
    let stats = manager.stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.total, 0);
    assert_eq!(factory.closes(), 1);
}

// ============================================================================
// DISCONNECT AND REINITIALIZATION
// ============================================================================

#[test]
fn test_acquire_after_disconnect_reinitializes() {
    let factory = MemFactory::new();
    let manager = connected(&factory);
    manager.cached_statement("SELECT 1").unwrap();

    manager.disconnect();
    manager.disconnect();
    assert!(!manager.is_connected());
    assert_eq!(manager.stats().cached_statements, 0);
    assert_eq!(factory.closes(), 1);

    let conn = manager.acquire().unwrap();
    assert!(manager.is_connected());
    assert!(conn.connection().is_some());
    assert_eq!(factory.connects(), 2);
}

#[test]
fn test_connection_leased_across_disconnect_is_closed_on_release() {
    let factory = MemFactory::new();
    let manager = connected(&factory);
    let conn = manager.acquire().unwrap();
    manager.disconnect();
    drop(conn);
    assert_eq!(factory.closes(), 1);
    assert_eq!(manager.stats().active, 0);
}

// ============================================================================
// HEALTH
// ============================================================================

#[test]
fn test_health_follows_database_state() {
    let factory = MemFactory::new();
    let manager = connected(&factory);
    assert!(manager.is_healthy());

    factory.set_down(true);
    assert!(!manager.is_healthy());

    factory.set_down(false);
    assert!(manager.is_healthy());

    manager.disconnect();
    assert!(!manager.is_healthy());
    assert!(!manager.is_connected());
}

// ============================================================================
// STATEMENT CACHE
// ============================================================================

#[test]
fn test_statement_cache_hits_and_clears_when_full() {
    let factory = MemFactory::new();
    let manager = ConnectionPoolManager::new(factory.clone());
    manager
        .connect(db_config().with_statement_cache_capacity(2))
        .unwrap();

    let a = manager.cached_statement("SELECT a FROM t").unwrap();
    assert_eq!(a.as_str(), "prepared:SELECT a FROM t");
    manager.cached_statement("SELECT b FROM t").unwrap();
    let again = manager.cached_statement("SELECT a FROM t").unwrap();
    assert!(Arc::ptr_eq(&a, &again));

    let stats = manager.stats();
    assert_eq!(stats.statement_hits, 1);
    assert_eq!(stats.statement_misses, 2);
    assert_eq!(stats.cached_statements, 2);

    manager.cached_statement("SELECT c FROM t").unwrap();
    let stats = manager.stats();
    assert_eq!(stats.statement_cache_clears, 1);
    assert_eq!(stats.cached_statements, 1);

    // Evicted by the clear, so prepared again.
    let fresh = manager.cached_statement("SELECT a FROM t").unwrap();
    assert!(!Arc::ptr_eq(&a, &fresh));
    assert_eq!(manager.stats().active, 0);
}

#[test]
fn test_failed_prepare_is_not_cached() {
    let manager = connected(&MemFactory::new());
    let err = manager.cached_statement("   ").unwrap_err();
    assert!(matches!(err, ConnectionError::Statement(ref msg) if msg.contains("empty statement")));
    assert_eq!(manager.stats().cached_statements, 0);
    assert_eq!(manager.stats().active, 0);
}

#[test]
fn test_panicking_prepare_retires_the_connection() {
    let factory = MemFactory::new();
    let manager = connected(&factory);
    let err = manager.cached_statement("SELECT CRASH").unwrap_err();
    assert!(matches!(err, ConnectionError::Statement(ref msg) if msg.contains("panicked")), "{err}");

    let stats = manager.stats();
    assert_eq!(stats.cached_statements, 0);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.destroyed, 1);
    assert_eq!(factory.closes(), 1);
    assert!(manager.cached_statement("SELECT 1").is_ok());
}

// ============================================================================
// RETIREMENT AND MAINTENANCE
// ============================================================================

#[test]
fn test_connection_past_lifetime_is_retired() {
    let factory = MemFactory::new();
    let manager = ConnectionPoolManager::new(factory.clone());
    manager
        .connect(db_config().with_max_lifetime(Duration::from_millis(30)))
        .unwrap();

    let conn = manager.acquire().unwrap();
    thread::sleep(Duration::from_millis(50));
    drop(conn);

    let stats = manager.stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.idle, 0);
    assert_eq!(factory.closes(), 1);
}

#[test]
fn test_validate_on_acquire_replaces_dead_connection() {
    let factory = MemFactory::new();
    let manager = ConnectionPoolManager::new(factory.clone());
    manager
        .connect(db_config().with_test_on_acquire(true))
        .unwrap();

    factory.set_down(true);
    let conn = manager.acquire().unwrap();
    assert!(conn.connection().is_some());
    let stats = manager.stats();
    assert_eq!(stats.destroyed, 1);
    assert_eq!(factory.connects(), 2);
}

#[test]
fn test_maintenance_retires_idle_down_to_min() {
    let factory = MemFactory::new();
    let manager = ConnectionPoolManager::new(factory.clone());
    manager
        .connect(db_config().with_idle_timeout(Duration::from_millis(20)))
        .unwrap();

    let held: Vec<_> = (0..3).map(|_| manager.acquire().unwrap()).collect();
    drop(held);
    assert_eq!(manager.stats().idle, 3);

    thread::sleep(Duration::from_millis(40));
    let report = manager.maintain();
    assert_eq!(report.retired, 2);
    assert_eq!(report.opened, 0);
    assert_eq!(manager.stats().idle, 1);
}

#[test]
fn test_maintenance_restores_min_idle() {
    let factory = MemFactory::new();
    let manager = ConnectionPoolManager::new(factory.clone());
    manager.connect(db_config().with_min_idle(2)).unwrap();

    let mut conn = manager.acquire().unwrap();
    conn.retire();
    drop(conn);
    assert_eq!(manager.stats().idle, 1);

    let report = manager.maintain();
    assert_eq!(report.opened, 1);
    assert_eq!(manager.stats().idle, 2);
}

#[test]
fn test_scheduled_maintenance_runs_on_dispatcher() {
    let dispatcher = TaskDispatcher::new(small_dispatcher_config(1, 16)).unwrap();
    let factory = MemFactory::new();
    let manager = Arc::new(ConnectionPoolManager::new(factory.clone()));
    manager
        .connect(db_config().with_idle_timeout(Duration::from_millis(10)))
        .unwrap();
    let held: Vec<_> = (0..3).map(|_| manager.acquire().unwrap()).collect();
    drop(held);

    let schedule = manager.schedule_maintenance(&dispatcher, Duration::from_millis(10));
    let deadline = Instant::now() + Duration::from_secs(2);
    while (manager.stats().idle > 1 || schedule.runs() == 0) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(manager.stats().idle, 1);
    assert!(schedule.runs() > 0);

    schedule.cancel();
    dispatcher.shutdown(Duration::from_secs(1));
}
