//! Bounded, self-healing database connection pool.
//!
//! Live connections are capped at `max_total`: capacity is reserved with a
//! compare-and-swap on a counter before a connection is opened, and handed
//! back when one is destroyed. Idle connections sit in a bounded lock-free
//! channel. A leased connection is wrapped in a [`PooledConnection`] whose
//! release runs exactly once, on `close()` or drop.
//!
//! The raw driver is supplied by the caller through [`ConnectionFactory`].
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionPoolManager::new(PgFactory::default());
//! manager.connect(ConnectionPoolConfig::new("postgres://localhost/app"))?;
//! let mut conn = manager.acquire()?;
//! let stmt = manager.cached_statement("SELECT name FROM users WHERE id = $1")?;
//! conn.close();
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConnectionPoolConfig;
use crate::core::{AppResult, ConnectionError, ScheduleHandle, TaskDispatcher};
use crate::util::{duration_micros, panic_message};

/// Longest single wait on the idle channel, so capacity freed by a destroyed
/// connection is noticed without a wake-up.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// A live low-level connection produced by a [`ConnectionFactory`].
pub trait RawConnection: Send + 'static {
    /// Driver-side prepared statement.
    type Statement: Send + Sync + 'static;

    /// Run the health-check query. False means the connection is unusable.
    fn validate(&mut self, query: &str) -> bool;

    /// Parse and plan `sql`.
    ///
    /// # Errors
    ///
    /// Whatever the driver reports for malformed SQL or a dead connection.
    fn prepare(&mut self, sql: &str) -> AppResult<Self::Statement>;

    /// Release driver resources. Called once before the connection is dropped.
    fn close(&mut self) {}
}

/// Opens raw connections from a connection string.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connection type produced.
    type Connection: RawConnection;

    /// Open a new connection to `url`.
    ///
    /// # Errors
    ///
    /// Any failure to reach or authenticate with the database.
    fn connect(&self, url: &str) -> AppResult<Self::Connection>;
}

type ConnectionOf<F> = <F as ConnectionFactory>::Connection;
type StatementOf<F> = <ConnectionOf<F> as RawConnection>::Statement;

/// Snapshot of pool and statement-cache activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Whether a pool is currently open.
    pub connected: bool,
    /// Live connections, idle and leased.
    pub total: usize,
    /// Connections waiting in the pool.
    pub idle: usize,
    /// Connections currently leased.
    pub active: u64,
    /// Connections opened since startup.
    pub created: u64,
    /// Connections closed since startup.
    pub destroyed: u64,
    /// Successful acquisitions.
    pub acquires: u64,
    /// Failed acquisitions.
    pub acquire_errors: u64,
    /// Sum of successful acquisition times, in microseconds.
    pub total_acquire_us: u64,
    /// Slowest successful acquisition, in microseconds.
    pub max_acquire_us: u64,
    /// Prepared statements currently cached.
    pub cached_statements: usize,
    /// Statement lookups answered from the cache.
    pub statement_hits: u64,
    /// Statement lookups that had to prepare.
    pub statement_misses: u64,
    /// Times the statement cache was cleared for being full.
    pub statement_cache_clears: u64,
}

impl ConnectionStats {
    /// Mean time to acquire a connection, if any were acquired.
    #[must_use]
    pub fn average_acquire_time(&self) -> Option<Duration> {
        (self.acquires > 0).then(|| Duration::from_micros(self.total_acquire_us / self.acquires))
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Idle connections closed for age or idleness.
    pub retired: usize,
    /// Connections opened to restore `min_idle`.
    pub opened: usize,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    active: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    acquires: AtomicU64,
    acquire_errors: AtomicU64,
    total_acquire_us: AtomicU64,
    max_acquire_us: AtomicU64,
    statement_hits: AtomicU64,
    statement_misses: AtomicU64,
    statement_cache_clears: AtomicU64,
}

struct IdleConnection<C> {
    conn: C,
    created_at: Instant,
    idle_since: Instant,
}

type Release<C> = Box<dyn FnOnce(C, Instant, bool) + Send>;

/// A leased connection. Goes back to the pool on [`close`](Self::close) or drop.
pub struct PooledConnection<C: RawConnection> {
    conn: Option<C>,
    created_at: Instant,
    broken: bool,
    release: Option<Release<C>>,
}

impl<C: RawConnection> PooledConnection<C> {
    /// The raw connection, or `None` once closed.
    #[must_use]
    pub const fn connection(&self) -> Option<&C> {
        self.conn.as_ref()
    }

    /// Mutable access to the raw connection, or `None` once closed.
    pub fn connection_mut(&mut self) -> Option<&mut C> {
        self.conn.as_mut()
    }

    /// Whether `close` has run.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// When the underlying connection was opened.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Mark the connection unusable so release closes it instead of pooling it.
    pub fn retire(&mut self) {
        self.broken = true;
    }

    /// Hand the connection back. Only the first call has any effect.
    pub fn close(&mut self) {
        if let (Some(conn), Some(release)) = (self.conn.take(), self.release.take()) {
            release(conn, self.created_at, self.broken);
        }
    }
}

impl<C: RawConnection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: RawConnection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("closed", &self.is_closed())
            .field("broken", &self.broken)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: Arc<F>,
    config: ConnectionPoolConfig,
    idle_tx: Sender<IdleConnection<ConnectionOf<F>>>,
    idle_rx: Receiver<IdleConnection<ConnectionOf<F>>>,
    total: AtomicUsize,
    closed: AtomicBool,
    counters: Arc<ConnectionCounters>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn new(factory: Arc<F>, config: ConnectionPoolConfig, counters: Arc<ConnectionCounters>) -> Self {
        let (idle_tx, idle_rx) = bounded(config.max_total);
        Self {
            factory,
            config,
            idle_tx,
            idle_rx,
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            counters,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Claim room for one more live connection.
    fn try_reserve(&self) -> bool {
        let mut current = self.total.load(Ordering::Acquire);
        loop {
            if current >= self.config.max_total {
                return false;
            }
            match self.total.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Open a connection into an already reserved slot.
    fn open(&self) -> Result<(ConnectionOf<F>, Instant), String> {
        let factory = Arc::clone(&self.factory);
        let url = self.config.url.clone();
        let opened = panic::catch_unwind(AssertUnwindSafe(move || factory.connect(&url)));
        match opened {
            Ok(Ok(conn)) => {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Ok((conn, Instant::now()))
            }
            Ok(Err(e)) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Err(format!("{e:#}"))
            }
            Err(payload) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Err(format!("connection factory panicked: {}", panic_message(payload.as_ref())))
            }
        }
    }

    fn destroy(&self, mut conn: ConnectionOf<F>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| conn.close())) {
            warn!(panic = %panic_message(payload.as_ref()), "connection close panicked");
        }
        drop(conn);
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn is_expired(&self, created_at: Instant) -> bool {
        self.config.max_lifetime_ms > 0 && created_at.elapsed() >= self.config.max_lifetime()
    }

    /// Vet an idle connection before leasing it; unusable ones are destroyed.
    fn check_out(&self, idle: IdleConnection<ConnectionOf<F>>) -> Option<(ConnectionOf<F>, Instant)> {
        let IdleConnection {
            mut conn, created_at, ..
        } = idle;
        if self.is_expired(created_at) {
            debug!("retiring connection past max lifetime");
            self.destroy(conn);
            return None;
        }
        if self.config.test_on_acquire {
            let query = self.config.health_check_query.as_str();
            let healthy = panic::catch_unwind(AssertUnwindSafe(|| conn.validate(query))).unwrap_or(false);
            if !healthy {
                debug!("retiring connection that failed validation");
                self.destroy(conn);
                return None;
            }
        }
        Some((conn, created_at))
    }

    fn acquire(self: &Arc<Self>) -> Result<PooledConnection<ConnectionOf<F>>, ConnectionError> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout();
        loop {
            if self.is_closed() {
                return Err(ConnectionError::Acquire {
                    reason: "pool is closed".into(),
                    waited: started.elapsed(),
                });
            }
            if let Ok(idle) = self.idle_rx.try_recv() {
                if let Some((conn, created_at)) = self.check_out(idle) {
                    return Ok(self.lease(conn, created_at));
                }
                continue;
            }
            if self.try_reserve() {
                return match self.open() {
                    Ok((conn, created_at)) => Ok(self.lease(conn, created_at)),
                    Err(reason) => Err(ConnectionError::Acquire {
                        reason,
                        waited: started.elapsed(),
                    }),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectionError::Acquire {
                    reason: format!("all {} connections are in use", self.config.max_total),
                    waited: started.elapsed(),
                });
            }
            if let Ok(idle) = self.idle_rx.recv_timeout((deadline - now).min(WAIT_SLICE)) {
                if let Some((conn, created_at)) = self.check_out(idle) {
                    return Ok(self.lease(conn, created_at));
                }
            }
        }
    }

    fn lease(self: &Arc<Self>, conn: ConnectionOf<F>, created_at: Instant) -> PooledConnection<ConnectionOf<F>> {
        self.counters.active.fetch_add(1, Ordering::AcqRel);
        let pool = Arc::clone(self);
        PooledConnection {
            conn: Some(conn),
            created_at,
            broken: false,
            release: Some(Box::new(move |conn: ConnectionOf<F>, created_at: Instant, broken: bool| {
                pool.release(conn, created_at, broken);
            })),
        }
    }

    fn release(&self, conn: ConnectionOf<F>, created_at: Instant, broken: bool) {
        self.counters.active.fetch_sub(1, Ordering::AcqRel);
        if self.is_closed() || broken || self.is_expired(created_at) {
            self.destroy(conn);
            return;
        }
        let idle = IdleConnection {
            conn,
            created_at,
            idle_since: Instant::now(),
        };
        match self.idle_tx.try_send(idle) {
            Ok(()) => {}
            Err(TrySendError::Full(idle) | TrySendError::Disconnected(idle)) => self.destroy(idle.conn),
        }
    }

    /// Open connections until `target` are idle. Stops at the first failure.
    fn fill_idle(&self, target: usize) -> Result<usize, String> {
        let mut opened = 0;
        while self.idle_rx.len() < target && self.try_reserve() {
            let (conn, created_at) = self.open()?;
            let idle = IdleConnection {
                conn,
                created_at,
                idle_since: Instant::now(),
            };
            if let Err(TrySendError::Full(idle) | TrySendError::Disconnected(idle)) = self.idle_tx.try_send(idle) {
                self.destroy(idle.conn);
                break;
            }
            opened += 1;
        }
        Ok(opened)
    }

    fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let mut keep = Vec::new();
        let idle_timeout = self.config.idle_timeout();
        while let Ok(idle) = self.idle_rx.try_recv() {
            let stale = self.config.idle_timeout_ms > 0
                && idle.idle_since.elapsed() >= idle_timeout
                && self.total.load(Ordering::Acquire) > self.config.min_idle;
            if stale || self.is_expired(idle.created_at) {
                self.destroy(idle.conn);
                report.retired += 1;
            } else {
                keep.push(idle);
            }
        }
        for idle in keep {
            if let Err(TrySendError::Full(idle) | TrySendError::Disconnected(idle)) = self.idle_tx.try_send(idle) {
                self.destroy(idle.conn);
            }
        }
        match self.fill_idle(self.config.min_idle) {
            Ok(opened) => report.opened = opened,
            Err(e) => warn!(error = %e, "could not restore minimum idle connections"),
        }
        report
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut closed = 0;
        while let Ok(idle) = self.idle_rx.try_recv() {
            self.destroy(idle.conn);
            closed += 1;
        }
        debug!(closed, "closed idle connections");
    }
}

/// Owns the connection pool and the prepared-statement cache.
pub struct ConnectionPoolManager<F: ConnectionFactory> {
    factory: Arc<F>,
    config: RwLock<Option<ConnectionPoolConfig>>,
    pool: RwLock<Option<Arc<PoolInner<F>>>>,
    init_lock: Mutex<()>,
    statements: DashMap<String, Arc<StatementOf<F>>>,
    counters: Arc<ConnectionCounters>,
}

impl<F: ConnectionFactory> ConnectionPoolManager<F> {
    /// Manager with no pool yet; call [`connect`](Self::connect) before use.
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            config: RwLock::new(None),
            pool: RwLock::new(None),
            init_lock: Mutex::new(()),
            statements: DashMap::new(),
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    /// Build the pool, warm `min_idle` connections and verify one with the
    /// health-check query.
    ///
    /// Replaces any pool already open.
    ///
    /// # Errors
    ///
    /// `ConnectionError::Init` if the configuration is invalid or the database
    /// cannot be reached. Startup should not continue past this error.
    pub fn connect(&self, config: ConnectionPoolConfig) -> Result<(), ConnectionError> {
        config.validate().map_err(ConnectionError::Init)?;
        let _init = self.init_lock.lock();

        if let Some(previous) = self.pool.write().take() {
            previous.close();
        }

        let pool = Arc::new(PoolInner::new(
            Arc::clone(&self.factory),
            config.clone(),
            Arc::clone(&self.counters),
        ));
        if let Err(e) = pool.fill_idle(config.min_idle) {
            pool.close();
            return Err(ConnectionError::Init(e));
        }

        let mut probe = match pool.acquire() {
            Ok(conn) => conn,
            Err(e) => {
                pool.close();
                return Err(ConnectionError::Init(e.to_string()));
            }
        };
        let query = config.health_check_query.clone();
        let healthy = probe
            .connection_mut()
            .is_some_and(|conn| panic::catch_unwind(AssertUnwindSafe(|| conn.validate(&query))).unwrap_or(false));
        if !healthy {
            probe.retire();
            drop(probe);
            pool.close();
            return Err(ConnectionError::Init(format!(
                "health check `{}` failed",
                config.health_check_query
            )));
        }
        drop(probe);

        info!(
            max_total = config.max_total,
            min_idle = config.min_idle,
            acquire_timeout_ms = config.acquire_timeout_ms,
            "connection pool ready"
        );
        *self.config.write() = Some(config);
        *self.pool.write() = Some(pool);
        Ok(())
    }

    /// The open pool, rebuilding it from the last configuration if it was closed.
    fn current_pool(&self) -> Result<Arc<PoolInner<F>>, ConnectionError> {
        if let Some(pool) = self.pool.read().as_ref() {
            if !pool.is_closed() {
                return Ok(Arc::clone(pool));
            }
        }

        let _init = self.init_lock.lock();
        if let Some(pool) = self.pool.read().as_ref() {
            if !pool.is_closed() {
                return Ok(Arc::clone(pool));
            }
        }
        let config = self
            .config
            .read()
            .clone()
            .ok_or(ConnectionError::NotConfigured)?;
        info!("reinitializing connection pool");
        let pool = Arc::new(PoolInner::new(
            Arc::clone(&self.factory),
            config,
            Arc::clone(&self.counters),
        ));
        *self.pool.write() = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Lease a connection, waiting up to the acquire timeout.
    ///
    /// Reinitializes the pool first if it was never opened in this process
    /// lifetime or has been closed. The caller decides whether to retry.
    ///
    /// # Errors
    ///
    /// `ConnectionError::NotConfigured` before the first `connect`,
    /// `ConnectionError::Acquire` on timeout or driver failure.
    pub fn acquire(&self) -> Result<PooledConnection<ConnectionOf<F>>, ConnectionError> {
        let started = Instant::now();
        match self.current_pool().and_then(|pool| pool.acquire()) {
            Ok(conn) => {
                let micros = duration_micros(started.elapsed());
                self.counters.acquires.fetch_add(1, Ordering::Relaxed);
                self.counters.total_acquire_us.fetch_add(micros, Ordering::Relaxed);
                self.counters.max_acquire_us.fetch_max(micros, Ordering::Relaxed);
                Ok(conn)
            }
            Err(e) => {
                self.counters.acquire_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "connection acquire failed");
                Err(e)
            }
        }
    }

    /// Prepared statement for `sql`, keyed by its exact text.
    ///
    /// When the cache is full it is cleared outright before the new entry is
    /// stored.
    ///
    /// # Errors
    ///
    /// Acquisition errors, or `ConnectionError::Statement` if preparing fails.
    pub fn cached_statement(&self, sql: &str) -> Result<Arc<StatementOf<F>>, ConnectionError> {
        if let Some(stmt) = self.statements.get(sql) {
            self.counters.statement_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(stmt.value()));
        }
        self.counters.statement_misses.fetch_add(1, Ordering::Relaxed);

        let mut conn = self.acquire()?;
        let prepared = match conn.connection_mut() {
            Some(raw) => panic::catch_unwind(AssertUnwindSafe(|| raw.prepare(sql))),
            None => return Err(ConnectionError::Statement("connection already closed".into())),
        };
        let stmt = match prepared {
            Ok(Ok(stmt)) => Arc::new(stmt),
            Ok(Err(e)) => {
                conn.close();
                return Err(ConnectionError::Statement(format!("{e:#}")));
            }
            Err(payload) => {
                // State after a driver panic is unknown; never pool it again.
                conn.retire();
                conn.close();
                return Err(ConnectionError::Statement(format!(
                    "statement preparation panicked: {}",
                    panic_message(payload.as_ref())
                )));
            }
        };
        conn.close();

        let capacity = self
            .config
            .read()
            .as_ref()
            .map_or(1, |c| c.statement_cache_capacity);
        if self.statements.len() >= capacity {
            self.statements.clear();
            self.counters
                .statement_cache_clears
                .fetch_add(1, Ordering::Relaxed);
            debug!(capacity, "statement cache full, cleared");
        }
        self.statements.insert(sql.to_owned(), Arc::clone(&stmt));
        Ok(stmt)
    }

    /// Probe the open pool with the health-check query. Never errors and never
    /// reopens a closed pool.
    pub fn is_healthy(&self) -> bool {
        let Some(pool) = self.pool.read().clone() else {
            return false;
        };
        if pool.is_closed() {
            return false;
        }
        let probe = panic::catch_unwind(AssertUnwindSafe(|| {
            let Ok(mut conn) = pool.acquire() else {
                return false;
            };
            let query = pool.config.health_check_query.as_str();
            let healthy = conn.connection_mut().is_some_and(|raw| raw.validate(query));
            if !healthy {
                conn.retire();
            }
            healthy
        }));
        probe.unwrap_or(false)
    }

    /// Clear the statement cache, then close the pool. Safe to call repeatedly.
    ///
    /// Leased connections are closed as they are released.
    pub fn disconnect(&self) {
        self.statements.clear();
        let _init = self.init_lock.lock();
        if let Some(pool) = self.pool.write().take() {
            pool.close();
            info!("connection pool closed");
        }
    }

    /// Whether a pool is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.pool.read().as_ref().is_some_and(|p| !p.is_closed())
    }

    /// Configuration of the last successful `connect`.
    #[must_use]
    pub fn config(&self) -> Option<ConnectionPoolConfig> {
        self.config.read().clone()
    }

    /// Retire idle connections past their idle timeout or lifetime, then top
    /// the pool back up to `min_idle`.
    pub fn maintain(&self) -> MaintenanceReport {
        let pool = self.pool.read().clone();
        match pool {
            Some(pool) if !pool.is_closed() => {
                let report = pool.maintain();
                if report.retired > 0 || report.opened > 0 {
                    debug!(retired = report.retired, opened = report.opened, "connection maintenance");
                }
                report
            }
            _ => MaintenanceReport::default(),
        }
    }

    /// Run [`maintain`](Self::maintain) every `period` on the scheduled class.
    ///
    /// The schedule holds only a weak reference; it does nothing once the
    /// manager is dropped.
    pub fn schedule_maintenance(self: &Arc<Self>, dispatcher: &TaskDispatcher, period: Duration) -> ScheduleHandle {
        let manager: Weak<Self> = Arc::downgrade(self);
        dispatcher.schedule_periodic(
            move || {
                if let Some(manager) = manager.upgrade() {
                    manager.maintain();
                }
                Ok(())
            },
            period,
            period,
        )
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        let pool = self.pool.read().clone();
        let c = &self.counters;
        let (connected, total, idle) = pool.as_ref().map_or((false, 0, 0), |p| {
            (!p.is_closed(), p.total.load(Ordering::Acquire), p.idle_rx.len())
        });
        ConnectionStats {
            connected,
            total,
            idle,
            active: c.active.load(Ordering::Acquire),
            created: c.created.load(Ordering::Relaxed),
            destroyed: c.destroyed.load(Ordering::Relaxed),
            acquires: c.acquires.load(Ordering::Relaxed),
            acquire_errors: c.acquire_errors.load(Ordering::Relaxed),
            total_acquire_us: c.total_acquire_us.load(Ordering::Relaxed),
            max_acquire_us: c.max_acquire_us.load(Ordering::Relaxed),
            cached_statements: self.statements.len(),
            statement_hits: c.statement_hits.load(Ordering::Relaxed),
            statement_misses: c.statement_misses.load(Ordering::Relaxed),
            statement_cache_clears: c.statement_cache_clears.load(Ordering::Relaxed),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPoolManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("connected", &self.is_connected())
            .field("cached_statements", &self.statements.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Conn {
        healthy: bool,
    }

    impl RawConnection for Conn {
        type Statement = String;

        fn validate(&mut self, _query: &str) -> bool {
            self.healthy
        }

        fn prepare(&mut self, sql: &str) -> AppResult<String> {
            Ok(sql.to_uppercase())
        }
    }

    struct Factory {
        healthy: bool,
    }

    impl ConnectionFactory for Factory {
        type Connection = Conn;

        fn connect(&self, url: &str) -> AppResult<Conn> {
            if url.starts_with("mem://") {
                Ok(Conn { healthy: self.healthy })
            } else {
                anyhow::bail!("unsupported scheme in {url}")
            }
        }
    }

    fn config() -> ConnectionPoolConfig {
        ConnectionPoolConfig::new("mem://test")
            .with_max_total(2)
            .with_min_idle(1)
            .with_acquire_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_reserve_respects_max_total() {
        let pool = PoolInner::new(
            Arc::new(Factory { healthy: true }),
            config(),
            Arc::new(ConnectionCounters::default()),
        );
        assert!(pool.try_reserve());
        assert!(pool.try_reserve());
        assert!(!pool.try_reserve());
    }

    #[test]
    fn test_close_runs_release_once() {
        let manager = ConnectionPoolManager::new(Factory { healthy: true });
        manager.connect(config()).unwrap();
        let mut conn = manager.acquire().unwrap();
        assert_eq!(manager.stats().active, 1);
        conn.close();
        conn.close();
        drop(conn);
        assert_eq!(manager.stats().active, 0);
    }

    #[test]
    fn test_unhealthy_database_fails_init() {
        let manager = ConnectionPoolManager::new(Factory { healthy: false });
        assert!(matches!(manager.connect(config()), Err(ConnectionError::Init(_))));
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_unreachable_database_fails_init() {
        let manager = ConnectionPoolManager::new(Factory { healthy: true });
        let err = manager.connect(ConnectionPoolConfig::new("tcp://nowhere")).unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"), "{err}");
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let manager = ConnectionPoolManager::new(Factory { healthy: true });
        manager.connect(config()).unwrap();
        let _a = manager.acquire().unwrap();
        let _b = manager.acquire().unwrap();
        let err = manager.acquire().unwrap_err();
        assert!(matches!(err, ConnectionError::Acquire { waited, .. } if waited >= Duration::from_millis(100)));
        assert_eq!(manager.stats().acquire_errors, 1);
    }
}
