//! Workload-partitioned task dispatcher.
//!
//! Work is routed to one of four independent pools by [`WorkloadClass`], so a
//! burst of slow database calls cannot starve CPU-bound or network work. Each
//! pool has dedicated OS threads and a bounded FIFO queue; when the queue is
//! full the configured [`BackpressurePolicy`] applies (caller-runs by default).
//!
//! Delayed and periodic work is armed on a single timer thread and executed
//! on the `Scheduled` pool. Timeouts and retries are built from the same
//! pieces: completion continuations plus timers, never a parked worker.
//! The timer thread itself never runs work; when a queue is full under
//! caller-runs its submissions go through a relay thread instead.
//!
//! # Example
//!
//! ```rust,ignore
//! let dispatcher = TaskDispatcher::new(DispatcherConfig::default())?;
//! let total = dispatcher
//!     .submit(WorkloadClass::General, || Ok(2 + 2))
//!     .then(&dispatcher, WorkloadClass::General, |n| Ok(n * 10))
//!     .join()?;
//! assert_eq!(total, 40);
//! ```

mod handle;
mod scheduler;
mod worker;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use handle::{Handle, TaskState};
pub use scheduler::ScheduleHandle;
pub use worker::ClassStats;

use handle::Completion;
use scheduler::{on_timer_thread, Cadence, Fire, ScheduleState, Scheduler};
use worker::{Admission, ClassPool, Disposition, Relay, WorkItem};

use crate::config::{BackpressurePolicy, DispatcherConfig};
use crate::core::{AppResult, ConfigError, TaskError};
use crate::util::panic_message;

/// Category of work, each routed to its own worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    /// CPU-bound or otherwise unclassified work.
    #[default]
    General,
    /// Blocking database I/O.
    Database,
    /// Blocking network I/O.
    Network,
    /// Delayed and periodic work.
    Scheduled,
}

impl WorkloadClass {
    /// Every class, in pool order.
    pub const ALL: [Self; 4] = [Self::General, Self::Database, Self::Network, Self::Scheduled];

    /// Lowercase name used in logs and thread names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Database => "database",
            Self::Network => "network",
            Self::Scheduled => "scheduled",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`TaskDispatcher::run_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Items submitted.
    pub attempted: usize,
    /// Items that produced a value.
    pub succeeded: usize,
    /// Items that ended in an error.
    pub failed: usize,
}

/// What [`TaskDispatcher::shutdown`] had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Work that settled during the grace period.
    pub drained: u64,
    /// Queued work cancelled after the grace period.
    pub cancelled: u64,
    /// Workers still busy at the deadline; they were detached.
    pub timed_out_workers: usize,
    /// Timers that were pending and will never fire.
    pub dropped_timers: usize,
}

struct DispatcherInner {
    pools: Vec<Arc<ClassPool>>,
    scheduler: Scheduler,
    relay: Relay,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl DispatcherInner {
    fn pool(&self, class: WorkloadClass) -> &Arc<ClassPool> {
        &self.pools[class.index()]
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route `work` to `class` and settle `completion` with its outcome.
    fn submit_job<T, F>(&self, class: WorkloadClass, completion: Arc<Completion<T>>, work: F)
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::Acquire) {
            completion.complete(Err(TaskError::Shutdown));
            return;
        }

        let pool = self.pool(class);
        let counters = Arc::clone(&pool.counters);
        let id = completion.id();
        counters.on_submit();

        let job = Box::new(move |disposition: Disposition| match disposition {
            Disposition::Run => {
                if !completion.mark_running() {
                    // Cancelled while queued; the handle is already settled.
                    counters.on_settled(Err(&TaskError::Cancelled));
                    return;
                }
                let started = Instant::now();
                let result = run_guarded(work);
                let elapsed = started.elapsed();
                match &result {
                    Ok(_) => counters.on_settled(Ok(elapsed)),
                    Err(e) => {
                        warn!(class = %class, task_id = id, error = %e, "task failed");
                        counters.add_elapsed(elapsed);
                        counters.on_settled(Err(e));
                    }
                }
                completion.complete(result);
            }
            Disposition::Abandon(e) => {
                counters.on_settled(Err(&e));
                completion.complete(Err(e));
            }
        });

        match pool.offer(WorkItem::new(id, class, job)) {
            Admission::Queued => {}
            Admission::Full(item) => match pool.config().backpressure {
                // The timer thread must stay free to fire other timers.
                BackpressurePolicy::CallerRuns if on_timer_thread() => {
                    debug!(class = %class, task_id = id, "queue full, relaying timer submission");
                    self.relay.hand_off(Arc::clone(pool), item);
                }
                BackpressurePolicy::CallerRuns => {
                    pool.counters.caller_runs.fetch_add(1, Ordering::Relaxed);
                    debug!(class = %class, task_id = id, "queue full, running on submitting thread");
                    item.run();
                }
                BackpressurePolicy::Reject => {
                    warn!(class = %class, task_id = id, "queue full, rejecting task");
                    item.abandon(TaskError::Rejected(class));
                }
            },
            Admission::Closed(item) => item.abandon(TaskError::Shutdown),
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::Acquire) {
            debug!("dispatcher dropped without shutdown, releasing threads");
            self.scheduler.signal_stop();
            for pool in &self.pools {
                pool.close();
            }
            self.relay.close();
        }
    }
}

fn run_guarded<T>(work: impl FnOnce() -> AppResult<T>) -> Result<T, TaskError> {
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::Failed(e)),
        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Runs work on per-class pools and hands back [`Handle`]s.
///
/// Cheap to clone; clones share the same pools. Threads are released by
/// [`shutdown`](Self::shutdown), or when the last clone is dropped.
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<DispatcherInner>,
}

impl TaskDispatcher {
    /// Start every class pool and the timer thread.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` for a zero-sized pool, `ConfigError::WorkerSpawn`
    /// if the OS refuses a thread.
    pub fn new(config: DispatcherConfig) -> Result<Self, ConfigError> {
        config.validate().map_err(ConfigError::Invalid)?;

        let mut pools = Vec::with_capacity(WorkloadClass::ALL.len());
        for class in WorkloadClass::ALL {
            pools.push(Arc::new(ClassPool::new(class, config.for_class(class).clone())?));
        }
        let scheduler = Scheduler::start().map_err(|e| ConfigError::WorkerSpawn(e.to_string()))?;
        let relay = Relay::start().map_err(|e| ConfigError::WorkerSpawn(e.to_string()))?;

        info!(
            general = config.general.worker_count,
            database = config.database.worker_count,
            network = config.network.worker_count,
            scheduled = config.scheduled.worker_count,
            "task dispatcher started"
        );

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                pools,
                scheduler,
                relay,
                next_id: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Run `work` on the `class` pool.
    ///
    /// An error returned by `work` (or a panic) settles the handle as failed;
    /// the worker thread carries on. After shutdown the handle settles as
    /// `TaskError::Shutdown` without running anything.
    pub fn submit<T, F>(&self, class: WorkloadClass, work: F) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        let completion = Completion::new(self.inner.next_id());
        self.inner.submit_job(class, Arc::clone(&completion), work);
        Handle::from_completion(completion)
    }

    /// [`submit`](Self::submit) for work that cannot fail.
    pub fn submit_with<T, F>(&self, class: WorkloadClass, work: F) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(class, move || Ok(work()))
    }

    /// Run side-effect `work` on `class`, or on the settling thread if the pool
    /// never runs it.
    ///
    /// Shutdown, rejection and cancellation before start all fall back to
    /// running `work` where that outcome is decided, so it runs exactly once.
    pub(crate) fn offload<F>(&self, class: WorkloadClass, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Some(work)));
        let runner = Arc::clone(&slot);
        let handle = self.submit_with(class, move || {
            let work = runner.lock().take();
            if let Some(work) = work {
                work();
            }
        });
        handle.inner.on_complete(move |result| {
            if let Err(e) = result {
                let work = slot.lock().take();
                if let Some(work) = work {
                    debug!(class = %class, reason = %e, "offload not accepted, running here");
                    work();
                }
            }
        });
    }

    /// Run `work` once on the scheduled pool after `delay`.
    ///
    /// Cancelling the handle before the delay elapses skips the run.
    pub fn schedule_once<T, F>(&self, work: F, delay: Duration) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        let completion = Completion::new(self.inner.next_id());
        let handle = Handle::from_completion(Arc::clone(&completion));
        let weak = Arc::downgrade(&self.inner);
        let armed = self.inner.scheduler.schedule_after(
            delay,
            Box::new(move |reason: Fire| {
                if reason == Fire::Shutdown {
                    completion.complete(Err(TaskError::Shutdown));
                    return;
                }
                if completion.is_cancel_requested() {
                    return;
                }
                match weak.upgrade() {
                    Some(inner) => inner.submit_job(WorkloadClass::Scheduled, completion, work),
                    None => {
                        completion.complete(Err(TaskError::Shutdown));
                    }
                }
            }),
        );
        if !armed {
            handle.inner.complete(Err(TaskError::Shutdown));
        }
        handle
    }

    /// Run `work` every `period`, first after `initial_delay`.
    ///
    /// Runs never overlap: the next one is armed when the previous finishes,
    /// due one period after the previous due time (late runs catch up). A
    /// failing run is logged and counted and the schedule continues.
    pub fn schedule_periodic<F>(&self, work: F, initial_delay: Duration, period: Duration) -> ScheduleHandle
    where
        F: Fn() -> AppResult<()> + Send + Sync + 'static,
    {
        self.schedule_recurring(work, initial_delay, Cadence::FixedRate(period.max(MIN_PERIOD)))
    }

    /// Run `work` repeatedly with `delay` between the end of one run and the
    /// start of the next, first after `initial_delay`.
    pub fn schedule_with_fixed_delay<F>(&self, work: F, initial_delay: Duration, delay: Duration) -> ScheduleHandle
    where
        F: Fn() -> AppResult<()> + Send + Sync + 'static,
    {
        self.schedule_recurring(work, initial_delay, Cadence::FixedDelay(delay.max(MIN_PERIOD)))
    }

    fn schedule_recurring<F>(&self, work: F, initial_delay: Duration, cadence: Cadence) -> ScheduleHandle
    where
        F: Fn() -> AppResult<()> + Send + Sync + 'static,
    {
        let handle = ScheduleHandle::new();
        let task = Arc::new(RecurringTask {
            id: self.inner.next_id(),
            work: Box::new(work),
            cadence,
            state: Arc::clone(&handle.state),
        });
        debug!(schedule_id = task.id, ?cadence, ?initial_delay, "recurring task scheduled");
        if !arm_recurring(&Arc::downgrade(&self.inner), task, Instant::now() + initial_delay) {
            handle.cancel();
        }
        handle
    }

    /// Run `work` on `class`, settling the handle as `TimedOut` if it has not
    /// finished within `timeout`.
    ///
    /// On timeout the work is cancelled if it has not started yet; work that
    /// is already running finishes in the background and its result is dropped.
    pub fn with_timeout<T, F>(&self, class: WorkloadClass, work: F, timeout: Duration) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
    {
        let outer = Completion::new(self.inner.next_id());
        let work_completion = Completion::new(self.inner.next_id());
        let settled = Arc::new(AtomicBool::new(false));

        {
            let outer = Arc::clone(&outer);
            let settled = Arc::clone(&settled);
            work_completion.on_complete(move |result| {
                settled.store(true, Ordering::Release);
                outer.complete(result);
            });
        }

        {
            let work_completion = Arc::clone(&work_completion);
            outer.on_cancel(move || {
                work_completion.cancel();
            });
        }

        let racer = Arc::clone(&outer);
        let victim = Arc::clone(&work_completion);
        self.inner.scheduler.schedule_after(
            timeout,
            Box::new(move |reason: Fire| {
                if reason == Fire::Shutdown || settled.load(Ordering::Acquire) {
                    return;
                }
                if racer.complete(Err(TaskError::TimedOut(timeout))) {
                    debug!(task_id = victim.id(), ?timeout, "task timed out");
                    victim.cancel();
                }
            }),
        );

        self.inner.submit_job(class, work_completion, work);
        Handle::from_completion(outer)
    }

    /// Run `work` on `class`, retrying up to `max_attempts` attempts in total
    /// with a fixed `delay` between them.
    ///
    /// The handle carries the first success or the error of the final attempt.
    /// A `max_attempts` of zero is treated as one.
    pub fn with_retry<T, F>(&self, class: WorkloadClass, work: F, max_attempts: u32, delay: Duration) -> Handle<T>
    where
        T: Send + 'static,
        F: Fn() -> AppResult<T> + Send + Sync + 'static,
    {
        let outer = Completion::new(self.inner.next_id());
        let plan = Arc::new(RetryPlan {
            class,
            work: Box::new(work),
            max_attempts: max_attempts.max(1),
            delay,
            outer: Arc::clone(&outer),
        });
        retry_attempt(Arc::downgrade(&self.inner), plan, 1);
        Handle::from_completion(outer)
    }

    /// Run every item on `class` with at most `concurrency` in flight.
    ///
    /// Blocks until every item has been attempted. `on_result` sees each
    /// successful value, in submission order.
    pub fn run_batch<T, F, I, R>(&self, class: WorkloadClass, items: I, concurrency: usize, mut on_result: R) -> BatchReport
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<T> + Send + 'static,
        I: IntoIterator<Item = F>,
        R: FnMut(T),
    {
        let permits = Permits::new(concurrency.max(1));
        let handles: Vec<Handle<T>> = items
            .into_iter()
            .map(|work| {
                let permit = permits.acquire();
                self.submit(class, move || {
                    let _permit = permit;
                    work()
                })
            })
            .collect();

        let mut report = BatchReport::default();
        for handle in handles {
            report.attempted += 1;
            match handle.join() {
                Ok(value) => {
                    report.succeeded += 1;
                    on_result(value);
                }
                Err(e) => {
                    report.failed += 1;
                    debug!(class = %class, error = %e, "batch item failed");
                }
            }
        }
        report
    }

    /// Wait for every handle, returning the outcomes in order.
    pub fn all_of<T: Send + 'static>(handles: impl IntoIterator<Item = Handle<T>>) -> Vec<Result<T, TaskError>> {
        handles.into_iter().map(Handle::join).collect()
    }

    /// Counters for one class.
    #[must_use]
    pub fn stats(&self, class: WorkloadClass) -> ClassStats {
        self.inner.pool(class).stats()
    }

    /// Counters for every class.
    #[must_use]
    pub fn all_stats(&self) -> Vec<ClassStats> {
        self.inner.pools.iter().map(|pool| pool.stats()).collect()
    }

    /// Timers armed and not yet fired.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.scheduler.pending()
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Stop accepting work, let queued and running work finish for up to
    /// `grace`, then cancel whatever is still queued.
    ///
    /// Always returns; workers stuck past the deadline are detached. Calling it
    /// again is a no-op that returns an empty report.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        let started = Instant::now();
        let deadline = started + grace;
        info!(?grace, "dispatcher shutting down");

        let settled_before = self.settled_total();
        let dropped_timers = self.inner.scheduler.stop();
        for pool in &self.inner.pools {
            pool.close();
        }
        self.inner.relay.stop();

        let mut report = ShutdownReport {
            dropped_timers,
            ..ShutdownReport::default()
        };
        for pool in &self.inner.pools {
            let stuck = pool.join_until(deadline);
            if stuck > 0 {
                report.timed_out_workers += stuck;
                report.cancelled += pool.abort();
            }
        }
        report.drained = self
            .settled_total()
            .saturating_sub(settled_before)
            .saturating_sub(report.cancelled);

        if report.timed_out_workers > 0 {
            warn!(
                timed_out_workers = report.timed_out_workers,
                cancelled = report.cancelled,
                "grace period elapsed with work still running"
            );
        }
        info!(
            drained = report.drained,
            dropped_timers = report.dropped_timers,
            elapsed = ?started.elapsed(),
            "dispatcher shut down"
        );
        report
    }

    fn settled_total(&self) -> u64 {
        self.all_stats()
            .iter()
            .map(|s| s.completed + s.failed)
            .sum()
    }
}

impl fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("shutting_down", &self.is_shutdown())
            .field("pending_timers", &self.pending_timers())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Handle<T> {
    /// Run `f` on `class` with this handle's value once it settles.
    ///
    /// An error upstream skips `f` and settles the returned handle with it.
    pub fn then<U, F>(self, dispatcher: &TaskDispatcher, class: WorkloadClass, f: F) -> Handle<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> AppResult<U> + Send + 'static,
    {
        let next = Completion::new(dispatcher.inner.next_id());
        let downstream = Arc::clone(&next);
        let weak = Arc::downgrade(&dispatcher.inner);
        self.inner.on_complete(move |result| match result {
            Ok(value) => match weak.upgrade() {
                Some(inner) => inner.submit_job(class, downstream, move || f(value)),
                None => {
                    downstream.complete(Err(TaskError::Shutdown));
                }
            },
            Err(e) => {
                downstream.complete(Err(e));
            }
        });
        Handle::from_completion(next)
    }
}

/// Shortest period a recurring schedule may use.
const MIN_PERIOD: Duration = Duration::from_millis(1);

struct RecurringTask {
    id: u64,
    work: Box<dyn Fn() -> AppResult<()> + Send + Sync>,
    cadence: Cadence,
    state: Arc<ScheduleState>,
}

fn arm_recurring(weak: &Weak<DispatcherInner>, task: Arc<RecurringTask>, due: Instant) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let weak = weak.clone();
    inner
        .scheduler
        .schedule_at(due, Box::new(move |reason: Fire| fire_recurring(weak, task, due, reason)))
}

fn fire_recurring(weak: Weak<DispatcherInner>, task: Arc<RecurringTask>, due: Instant, reason: Fire) {
    if reason == Fire::Shutdown || task.state.cancelled.load(Ordering::Acquire) {
        debug!(schedule_id = task.id, "recurring task stopped");
        return;
    }
    let Some(inner) = weak.upgrade() else {
        return;
    };

    let completion = Completion::<()>::new(inner.next_id());
    let runner = Arc::clone(&task);
    inner.submit_job(WorkloadClass::Scheduled, Arc::clone(&completion), move || (runner.work)());
    drop(inner);

    completion.on_complete(move |result| {
        match result {
            Ok(()) => {
                task.state.runs.fetch_add(1, Ordering::AcqRel);
            }
            Err(TaskError::Shutdown | TaskError::Cancelled) => return,
            Err(TaskError::Rejected(_)) => {
                warn!(schedule_id = task.id, "scheduled queue full, skipping this run");
            }
            Err(e) => {
                task.state.failures.fetch_add(1, Ordering::AcqRel);
                task.state.runs.fetch_add(1, Ordering::AcqRel);
                error!(schedule_id = task.id, error = %e, "recurring task failed, keeping it scheduled");
            }
        }
        let next = task.cadence.next_due(due);
        arm_recurring(&weak, task, next);
    });
}

struct RetryPlan<T> {
    class: WorkloadClass,
    work: Box<dyn Fn() -> AppResult<T> + Send + Sync>,
    max_attempts: u32,
    delay: Duration,
    outer: Arc<Completion<T>>,
}

fn retry_attempt<T: Send + 'static>(weak: Weak<DispatcherInner>, plan: Arc<RetryPlan<T>>, attempt: u32) {
    if plan.outer.is_cancel_requested() {
        return;
    }
    let Some(inner) = weak.upgrade() else {
        plan.outer.complete(Err(TaskError::Shutdown));
        return;
    };

    let completion = Completion::new(inner.next_id());
    let runner = Arc::clone(&plan);
    inner.submit_job(plan.class, Arc::clone(&completion), move || (runner.work)());
    drop(inner);

    completion.on_complete(move |result| match result {
        Ok(value) => {
            plan.outer.complete(Ok(value));
        }
        Err(TaskError::Shutdown) => {
            plan.outer.complete(Err(TaskError::Shutdown));
        }
        Err(e) if attempt < plan.max_attempts => {
            debug!(attempt, max_attempts = plan.max_attempts, error = %e, "attempt failed, retrying");
            if plan.delay.is_zero() {
                retry_attempt(weak, plan, attempt + 1);
                return;
            }
            let Some(inner) = weak.upgrade() else {
                plan.outer.complete(Err(e));
                return;
            };
            let next_plan = Arc::clone(&plan);
            let next_weak = weak.clone();
            let armed = inner.scheduler.schedule_after(
                plan.delay,
                Box::new(move |reason: Fire| {
                    if reason == Fire::Shutdown {
                        next_plan.outer.complete(Err(TaskError::Shutdown));
                    } else {
                        retry_attempt(next_weak, next_plan, attempt + 1);
                    }
                }),
            );
            if !armed {
                plan.outer.complete(Err(e));
            }
        }
        Err(e) => {
            warn!(attempts = attempt, error = %e, "giving up after final attempt");
            plan.outer.complete(Err(e));
        }
    });
}

/// Batch concurrency limit as a pool of tokens in a bounded channel.
///
/// Taking a permit receives a token; dropping it sends the token back.
struct Permits {
    give: Sender<()>,
    take: Receiver<()>,
}

impl Permits {
    fn new(count: usize) -> Self {
        let (give, take) = bounded(count);
        for _ in 0..count {
            let _ = give.try_send(());
        }
        Self { give, take }
    }

    /// Block until a token is free.
    fn acquire(&self) -> Permit {
        // Never disconnected: `self` holds both ends.
        let _ = self.take.recv();
        Permit {
            give: self.give.clone(),
        }
    }
}

/// Released on drop, whether the work ran or was abandoned.
struct Permit {
    give: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.give.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerPoolConfig;

    fn small() -> TaskDispatcher {
        let pool = WorkerPoolConfig::new().with_worker_count(2).with_queue_capacity(16);
        TaskDispatcher::new(DispatcherConfig::uniform(&pool)).unwrap()
    }

    #[test]
    fn test_class_names_round_trip_through_serde() {
        assert_eq!(WorkloadClass::Database.to_string(), "database");
        let json = serde_json::to_string(&WorkloadClass::Scheduled).unwrap();
        assert_eq!(json, "\"scheduled\"");
        assert_eq!(WorkloadClass::ALL.map(WorkloadClass::index), [0, 1, 2, 3]);
    }

    #[test]
    fn test_submit_and_join() {
        let dispatcher = small();
        let handle = dispatcher.submit(WorkloadClass::General, || Ok(21 * 2));
        assert_eq!(handle.join().unwrap(), 42);
        let stats = dispatcher.stats(WorkloadClass::General);
        assert_eq!((stats.submitted, stats.completed, stats.in_flight), (1, 1, 0));
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_error_and_panic_are_captured() {
        let dispatcher = small();
        let failed = dispatcher.submit::<(), _>(WorkloadClass::Network, || anyhow::bail!("unreachable host"));
        let panicked = dispatcher.submit::<(), _>(WorkloadClass::Network, || panic!("boom"));
        let err = failed.join().unwrap_err();
        assert_eq!(err.source_error().unwrap().to_string(), "unreachable host");
        assert!(matches!(panicked.join(), Err(TaskError::Panicked(msg)) if msg == "boom"));
        // The same workers still serve new work.
        assert_eq!(dispatcher.submit_with(WorkloadClass::Network, || 1).join().unwrap(), 1);
        assert_eq!(dispatcher.stats(WorkloadClass::Network).failed, 2);
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_then_chains_and_short_circuits() {
        let dispatcher = small();
        let chained = dispatcher
            .submit(WorkloadClass::General, || Ok(5))
            .then(&dispatcher, WorkloadClass::Database, |n| Ok(n + 1));
        assert_eq!(chained.join().unwrap(), 6);

        let skipped = dispatcher
            .submit::<i32, _>(WorkloadClass::General, || anyhow::bail!("first step failed"))
            .then(&dispatcher, WorkloadClass::General, |n| Ok(n + 1));
        assert!(matches!(skipped.join(), Err(TaskError::Failed(_))));
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_schedule_once_cancelled_before_due() {
        let dispatcher = small();
        let handle = dispatcher.schedule_once(|| Ok("ran"), Duration::from_secs(30));
        assert!(handle.cancel());
        assert!(matches!(handle.join(), Err(TaskError::Cancelled)));
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_submit_after_shutdown_settles_immediately() {
        let dispatcher = small();
        dispatcher.shutdown(Duration::from_secs(1));
        assert!(dispatcher.is_shutdown());
        let handle = dispatcher.submit_with(WorkloadClass::General, || 1);
        assert!(matches!(handle.join(), Err(TaskError::Shutdown)));
        assert_eq!(dispatcher.shutdown(Duration::ZERO), ShutdownReport::default());
    }

    #[test]
    fn test_permits_block_until_one_is_returned() {
        let permits = Arc::new(Permits::new(1));
        let first = permits.acquire();
        let waiter = {
            let permits = Arc::clone(&permits);
            std::thread::spawn(move || drop(permits.acquire()))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(first);
        waiter.join().unwrap();
        assert_eq!(permits.take.len(), 1);
    }
}
