//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use switchyard::config::{ConnectionPoolConfig, DispatcherConfig, WorkerPoolConfig};
use switchyard::core::{AppResult, CommandEvent, ExecutionContext, RawConnection, ConnectionFactory};

// ============================================================================
// IN-MEMORY DATABASE
// ============================================================================

/// Switches shared between a test and the connections it hands out.
#[derive(Debug, Default)]
pub struct DbState {
    pub down: AtomicBool,
    pub refuse_connections: AtomicBool,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub prepares: AtomicUsize,
}

pub struct MemConnection {
    state: Arc<DbState>,
}

impl RawConnection for MemConnection {
    type Statement = String;

    fn validate(&mut self, _query: &str) -> bool {
        !self.state.down.load(Ordering::SeqCst)
    }

    fn prepare(&mut self, sql: &str) -> AppResult<String> {
        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        if sql.trim().is_empty() {
            anyhow::bail!("empty statement");
        }
        assert!(!sql.contains("CRASH"), "driver crashed on {sql}");
        Ok(format!("prepared:{sql}"))
    }

    fn close(&mut self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct MemFactory {
    pub state: Arc<DbState>,
}

impl MemFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }
}

impl ConnectionFactory for MemFactory {
    type Connection = MemConnection;

    fn connect(&self, url: &str) -> AppResult<MemConnection> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused by {url}");
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemConnection {
            state: Arc::clone(&self.state),
        })
    }
}

pub fn db_config() -> ConnectionPoolConfig {
    ConnectionPoolConfig::new("mem://switchyard-test")
        .with_max_total(3)
        .with_min_idle(1)
        .with_acquire_timeout(Duration::from_millis(200))
}

// ============================================================================
// DISPATCHER SIZING
// ============================================================================

pub fn small_dispatcher_config(workers: usize, queue: usize) -> DispatcherConfig {
    DispatcherConfig::uniform(
        &WorkerPoolConfig::new()
            .with_worker_count(workers)
            .with_queue_capacity(queue),
    )
}

// ============================================================================
// COMMAND HANDLERS
// ============================================================================

pub fn counting_handler(
    counter: Arc<AtomicUsize>,
) -> impl Fn(&ExecutionContext, &CommandEvent) -> AppResult<()> + Send + Sync + 'static {
    move |_: &ExecutionContext, _: &CommandEvent| -> AppResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn noop_handler(_: &ExecutionContext, _: &CommandEvent) -> AppResult<()> {
    Ok(())
}

pub fn caps(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}
