//! Bounded pool of reusable, resettable objects.
//!
//! The idle set is a bounded lock-free channel sized to `max_size`, so the
//! `idle <= max_size` bound is enforced by the queue itself. Borrowing never
//! blocks: an empty idle set means a fresh object is built on the spot and the
//! overflow is recorded in the metrics.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchyard::core::ObjectPool;
//!
//! let pool = ObjectPool::string_buffers(8, 64)?;
//! {
//!     let mut buf = pool.lease();
//!     buf.push_str("scratch");
//! } // cleared and returned here
//! assert_eq!(pool.metrics().returns, 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{AppResult, ConfigError};
use crate::util::panic_message;

/// String buffers grown beyond this are shrunk back on reset.
const RETAINED_STRING_CAPACITY: usize = 64 * 1024;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) -> AppResult<()> + Send + Sync>;

/// Snapshot of pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Objects currently idle in the pool.
    pub size: usize,
    /// Upper bound on idle objects.
    pub max_size: usize,
    /// Objects built eagerly at construction or by `prefill`.
    pub preallocated: u64,
    /// Total borrows.
    pub borrows: u64,
    /// Total returns (including ones that were then discarded).
    pub returns: u64,
    /// Objects built on demand because the idle set was empty.
    pub creates: u64,
    /// Successful resets.
    pub resets: u64,
    /// Resets that failed or panicked; those objects were dropped.
    pub reset_failures: u64,
    /// Clean objects dropped because the pool was already full.
    pub discards: u64,
}

impl PoolMetrics {
    /// Fraction of borrows served from the idle set: `(borrows - creates) / borrows`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        if self.borrows == 0 {
            return 0.0;
        }
        self.borrows.saturating_sub(self.creates) as f64 / self.borrows as f64
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    preallocated: AtomicU64,
    borrows: AtomicU64,
    returns: AtomicU64,
    creates: AtomicU64,
    resets: AtomicU64,
    reset_failures: AtomicU64,
    discards: AtomicU64,
}

/// Thread-safe pool of reusable `T`s.
///
/// A borrowed object is owned exclusively by the caller until it is handed
/// back, so no locking is needed around its use.
pub struct ObjectPool<T> {
    idle_tx: Sender<T>,
    idle_rx: Receiver<T>,
    factory: Factory<T>,
    reset: Reset<T>,
    max_size: usize,
    counters: PoolCounters,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Create a pool and eagerly build `initial_size` objects.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InitialExceedsMax` if `initial_size > max_size`
    /// - `ConfigError::Invalid` if `max_size` is zero
    pub fn new<F, R>(
        factory: F,
        reset: R,
        initial_size: usize,
        max_size: usize,
    ) -> Result<Self, ConfigError>
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) -> AppResult<()> + Send + Sync + 'static,
    {
        if max_size == 0 {
            return Err(ConfigError::Invalid("max_size must be greater than 0".into()));
        }
        if initial_size > max_size {
            return Err(ConfigError::InitialExceedsMax {
                initial: initial_size,
                max: max_size,
            });
        }

        let (idle_tx, idle_rx) = bounded(max_size);
        let pool = Self {
            idle_tx,
            idle_rx,
            factory: Box::new(factory),
            reset: Box::new(reset),
            max_size,
            counters: PoolCounters::default(),
        };
        pool.prefill(initial_size);

        debug!(initial_size, max_size, "object pool created");
        Ok(pool)
    }

    /// Take an idle object, or build one if none is idle. Never blocks.
    pub fn borrow(&self) -> T {
        self.counters.borrows.fetch_add(1, Ordering::Relaxed);
        if let Ok(obj) = self.idle_rx.try_recv() {
            return obj;
        }
        self.counters.creates.fetch_add(1, Ordering::Relaxed);
        debug!(max_size = self.max_size, "object pool overflow, allocating on demand");
        (self.factory)()
    }

    /// Borrow an object wrapped in a guard that returns it on drop.
    pub fn lease(&self) -> PooledObject<'_, T> {
        PooledObject {
            obj: Some(self.borrow()),
            pool: self,
        }
    }

    /// Reset `obj` and put it back in the idle set.
    ///
    /// A failed or panicking reset drops the object so the pool never holds a
    /// dirty instance. A full pool drops the object too. Neither case is an
    /// error for the caller.
    pub fn return_object(&self, mut obj: T) {
        self.counters.returns.fetch_add(1, Ordering::Relaxed);

        let reset = panic::catch_unwind(AssertUnwindSafe(|| (self.reset)(&mut obj)));
        match reset {
            Ok(Ok(())) => {
                self.counters.resets.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.counters.reset_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "object reset failed, discarding");
                return;
            }
            Err(payload) => {
                self.counters.reset_failures.fetch_add(1, Ordering::Relaxed);
                warn!(panic = %panic_message(payload.as_ref()), "object reset panicked, discarding");
                return;
            }
        }

        match self.idle_tx.try_send(obj) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.counters.discards.fetch_add(1, Ordering::Relaxed);
                debug!(max_size = self.max_size, "object pool full, discarding returned object");
            }
        }
    }

    /// Build objects until `target` are idle or the pool is full. Returns how many were added.
    pub fn prefill(&self, target: usize) -> usize {
        let mut added = 0;
        while self.idle_rx.len() < target.min(self.max_size) {
            if self.idle_tx.try_send((self.factory)()).is_err() {
                break;
            }
            added += 1;
        }
        self.counters
            .preallocated
            .fetch_add(added as u64, Ordering::Relaxed);
        added
    }

    /// Objects currently idle.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    /// Upper bound on idle objects.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Current utilization counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let c = &self.counters;
        PoolMetrics {
            size: self.idle_rx.len(),
            max_size: self.max_size,
            preallocated: c.preallocated.load(Ordering::Relaxed),
            borrows: c.borrows.load(Ordering::Relaxed),
            returns: c.returns.load(Ordering::Relaxed),
            creates: c.creates.load(Ordering::Relaxed),
            resets: c.resets.load(Ordering::Relaxed),
            reset_failures: c.reset_failures.load(Ordering::Relaxed),
            discards: c.discards.load(Ordering::Relaxed),
        }
    }
}

impl ObjectPool<String> {
    /// Pool of string builders, cleared on return and shrunk if they grew large.
    ///
    /// # Errors
    ///
    /// Same as [`ObjectPool::new`].
    pub fn string_buffers(initial_size: usize, max_size: usize) -> Result<Self, ConfigError> {
        Self::new(
            String::new,
            |s: &mut String| {
                s.clear();
                if s.capacity() > RETAINED_STRING_CAPACITY {
                    s.shrink_to(RETAINED_STRING_CAPACITY);
                }
                Ok(())
            },
            initial_size,
            max_size,
        )
    }
}

impl ObjectPool<Vec<u8>> {
    /// Pool of byte buffers pre-sized to `capacity`, cleared on return.
    ///
    /// # Errors
    ///
    /// Same as [`ObjectPool::new`].
    pub fn byte_buffers(
        initial_size: usize,
        max_size: usize,
        capacity: usize,
    ) -> Result<Self, ConfigError> {
        Self::new(
            move || Vec::with_capacity(capacity),
            move |buf: &mut Vec<u8>| {
                buf.clear();
                if buf.capacity() > capacity.saturating_mul(4) {
                    buf.shrink_to(capacity);
                }
                Ok(())
            },
            initial_size,
            max_size,
        )
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("idle", &self.idle_rx.len())
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

/// A borrowed object that goes back to its pool when dropped.
pub struct PooledObject<'a, T: Send + 'static> {
    obj: Option<T>,
    pool: &'a ObjectPool<T>,
}

impl<T: Send + 'static> PooledObject<'_, T> {
    /// Keep the object instead of returning it to the pool.
    #[must_use]
    pub fn detach(mut self) -> T {
        // `obj` is only `None` after detach or drop, both of which consume the guard.
        match self.obj.take() {
            Some(obj) => obj,
            None => unreachable!("pooled object already taken"),
        }
    }
}

impl<T: Send + 'static> Deref for PooledObject<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.obj.as_ref() {
            Some(obj) => obj,
            None => unreachable!("pooled object already taken"),
        }
    }
}

impl<T: Send + 'static> DerefMut for PooledObject<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.obj.as_mut() {
            Some(obj) => obj,
            None => unreachable!("pooled object already taken"),
        }
    }
}

impl<T: Send + 'static> Drop for PooledObject<'_, T> {
    fn drop(&mut self) {
        if let Some(obj) = self.obj.take() {
            self.pool.return_object(obj);
        }
    }
}
