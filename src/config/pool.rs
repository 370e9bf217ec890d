//! Worker pool, dispatcher, object pool and connection pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::WorkloadClass;

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What a class pool does when its queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// The submitting thread runs the work itself.
    #[default]
    CallerRuns,
    /// The work is settled immediately with `TaskError::Rejected`.
    Reject,
}

/// Sizing for one workload-class pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Dedicated OS threads.
    pub worker_count: usize,
    /// Bounded queue length before backpressure applies.
    pub queue_capacity: usize,
    /// Stack size of each worker thread, in bytes.
    pub thread_stack_size: usize,
    /// Behaviour on a full queue.
    pub backpressure: BackpressurePolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPoolConfig {
    /// One worker per CPU with the default queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            thread_stack_size: DEFAULT_STACK_SIZE,
            backpressure: BackpressurePolicy::CallerRuns,
        }
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the full-queue policy.
    #[must_use]
    pub const fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// A message naming the first out-of-range value.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}

/// Pools for all four workload classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// CPU-bound work.
    pub general: WorkerPoolConfig,
    /// Blocking database I/O.
    pub database: WorkerPoolConfig,
    /// Blocking network I/O.
    pub network: WorkerPoolConfig,
    /// Delayed and periodic work.
    pub scheduled: WorkerPoolConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            general: WorkerPoolConfig::new().with_worker_count(cpus),
            database: WorkerPoolConfig::new().with_worker_count(cpus * 2),
            network: WorkerPoolConfig::new().with_worker_count(cpus * 2),
            scheduled: WorkerPoolConfig::new()
                .with_worker_count(2)
                .with_queue_capacity(256),
        }
    }
}

impl DispatcherConfig {
    /// Same sizing for every class. Handy for tests.
    #[must_use]
    pub fn uniform(pool: &WorkerPoolConfig) -> Self {
        Self {
            general: pool.clone(),
            database: pool.clone(),
            network: pool.clone(),
            scheduled: pool.clone(),
        }
    }

    /// Configuration of `class`.
    #[must_use]
    pub const fn for_class(&self, class: WorkloadClass) -> &WorkerPoolConfig {
        match class {
            WorkloadClass::General => &self.general,
            WorkloadClass::Database => &self.database,
            WorkloadClass::Network => &self.network,
            WorkloadClass::Scheduled => &self.scheduled,
        }
    }

    /// Validate every class.
    ///
    /// # Errors
    ///
    /// The first invalid class and what is wrong with it.
    pub fn validate(&self) -> Result<(), String> {
        for class in WorkloadClass::ALL {
            self.for_class(class)
                .validate()
                .map_err(|e| format!("{class} pool: {e}"))?;
        }
        Ok(())
    }
}

/// Sizing for an object pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectPoolConfig {
    /// Objects built eagerly.
    pub initial_size: usize,
    /// Upper bound on idle objects.
    pub max_size: usize,
}

impl Default for ObjectPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 16,
            max_size: 128,
        }
    }
}

impl ObjectPoolConfig {
    /// Validate pool bounds.
    ///
    /// # Errors
    ///
    /// A message describing the inconsistent bound.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".into());
        }
        if self.initial_size > self.max_size {
            return Err(format!(
                "initial_size {} exceeds max_size {}",
                self.initial_size, self.max_size
            ));
        }
        Ok(())
    }
}

/// Database connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Connection string handed to the factory.
    pub url: String,
    /// Upper bound on live connections, idle and leased.
    pub max_total: usize,
    /// Idle connections kept warm.
    pub min_idle: usize,
    /// How long `acquire` waits for a free connection.
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are retired by maintenance.
    pub idle_timeout_ms: u64,
    /// Connections older than this are retired on release.
    pub max_lifetime_ms: u64,
    /// Cheap query used for health checks.
    pub health_check_query: String,
    /// Prepared statements held before the cache is cleared.
    pub statement_cache_capacity: usize,
    /// Validate idle connections before handing them out.
    pub test_on_acquire: bool,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_total: 10,
            min_idle: 2,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 600_000,
            max_lifetime_ms: 1_800_000,
            health_check_query: "SELECT 1".into(),
            statement_cache_capacity: 100,
            test_on_acquire: false,
        }
    }
}

impl ConnectionPoolConfig {
    /// Defaults pointed at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Set the live-connection bound.
    #[must_use]
    pub const fn with_max_total(mut self, max_total: usize) -> Self {
        self.max_total = max_total;
        self
    }

    /// Set the warm idle count.
    #[must_use]
    pub const fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime_ms = lifetime.as_millis() as u64;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Validate idle connections on every acquire.
    #[must_use]
    pub const fn with_test_on_acquire(mut self, enabled: bool) -> Self {
        self.test_on_acquire = enabled;
        self
    }

    /// Set the statement cache bound.
    #[must_use]
    pub const fn with_statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    /// Acquire timeout as a `Duration`.
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Idle timeout as a `Duration`.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Maximum lifetime as a `Duration`.
    #[must_use]
    pub const fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    /// Validate connection pool values.
    ///
    /// # Errors
    ///
    /// A message naming the first out-of-range value.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("url must not be empty".into());
        }
        if self.max_total == 0 {
            return Err("max_total must be greater than 0".into());
        }
        if self.min_idle > self.max_total {
            return Err(format!(
                "min_idle {} exceeds max_total {}",
                self.min_idle, self.max_total
            ));
        }
        if self.acquire_timeout_ms == 0 {
            return Err("acquire_timeout_ms must be greater than 0".into());
        }
        if self.statement_cache_capacity == 0 {
            return Err("statement_cache_capacity must be greater than 0".into());
        }
        Ok(())
    }
}
