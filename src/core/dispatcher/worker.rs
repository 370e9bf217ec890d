//! One worker pool per workload class, backed by dedicated OS threads.
//!
//! # Design Principles
//!
//! - **No polling**: workers block on a bounded crossbeam channel
//! - **Caller-runs backpressure**: a full queue hands the item back to the submitter
//! - **Clean shutdown**: dropping the sender lets workers drain and exit naturally;
//!   anything still queued past the grace period is cancelled, not run

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, SendError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::WorkerPoolConfig;
use crate::core::{ConfigError, TaskError, WorkloadClass};
use crate::util::duration_micros;

/// What a worker should do with a dequeued item.
pub(crate) enum Disposition {
    /// Run the work.
    Run,
    /// Settle the handle with this error without running.
    Abandon(TaskError),
}

type Job = Box<dyn FnOnce(Disposition) + Send>;

/// A unit of work in flight through a class pool.
///
/// Dropping an item that was never run or abandoned (for example when its
/// queue is torn down with it) settles it as `Shutdown`.
pub(crate) struct WorkItem {
    id: u64,
    class: WorkloadClass,
    submitted_at: Instant,
    job: Option<Job>,
}

impl WorkItem {
    pub(crate) fn new(id: u64, class: WorkloadClass, job: Job) -> Self {
        Self {
            id,
            class,
            submitted_at: Instant::now(),
            job: Some(job),
        }
    }

    pub(crate) fn run(mut self) {
        trace!(
            class = %self.class,
            task_id = self.id,
            queue_wait_us = duration_micros(self.submitted_at.elapsed()),
            "running task"
        );
        if let Some(job) = self.job.take() {
            job(Disposition::Run);
        }
    }

    pub(crate) fn abandon(mut self, error: TaskError) {
        if let Some(job) = self.job.take() {
            job(Disposition::Abandon(error));
        }
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            job(Disposition::Abandon(TaskError::Shutdown));
        }
    }
}

/// Outcome of offering an item to a class queue.
pub(crate) enum Admission {
    /// Queued for a worker.
    Queued,
    /// The queue is full; the caller gets the item back.
    Full(WorkItem),
    /// The pool no longer accepts work.
    Closed(WorkItem),
}

/// Per-class utilization snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassStats {
    /// Workload class these numbers belong to.
    pub class: WorkloadClass,
    /// Worker threads in the pool.
    pub worker_count: usize,
    /// Bounded queue capacity.
    pub queue_capacity: usize,
    /// Total accepted submissions.
    pub submitted: u64,
    /// Work that finished with a value.
    pub completed: u64,
    /// Work that ended in any error (failures, panics, cancellations, rejections).
    pub failed: u64,
    /// Subset of `failed` that was cancelled before running.
    pub cancelled: u64,
    /// Subset of `failed` turned away by a full queue under the reject policy.
    pub rejected: u64,
    /// Submissions run on the submitting thread because the queue was full.
    pub caller_runs: u64,
    /// Submissions from the timer thread that found the queue full and were
    /// handed to the relay thread instead of running inline.
    pub relayed: u64,
    /// Accepted but not yet settled.
    pub in_flight: u64,
    /// Waiting in the queue.
    pub queued: u64,
    /// Sum of execution time of finished work, in microseconds.
    pub total_elapsed_us: u64,
}

impl ClassStats {
    /// Mean execution time of work that ran, if any did.
    #[must_use]
    pub fn average_elapsed(&self) -> Option<Duration> {
        let ran = (self.completed + self.failed)
            .saturating_sub(self.cancelled)
            .saturating_sub(self.rejected);
        (ran > 0).then(|| Duration::from_micros(self.total_elapsed_us / ran))
    }
}

/// Lock-free counters for one class.
#[derive(Debug, Default)]
pub(crate) struct ClassCounters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub rejected: AtomicU64,
    pub caller_runs: AtomicU64,
    pub relayed: AtomicU64,
    pub queued: AtomicU64,
    pub total_elapsed_us: AtomicU64,
}

impl ClassCounters {
    /// Record acceptance of a new item. Must precede any settlement of it.
    pub fn on_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Release);
    }

    /// Record a settled item.
    pub fn on_settled(&self, outcome: Result<Duration, &TaskError>) {
        match outcome {
            Ok(elapsed) => {
                self.total_elapsed_us
                    .fetch_add(duration_micros(elapsed), Ordering::Relaxed);
                self.completed.fetch_add(1, Ordering::Release);
            }
            Err(error) => {
                match error {
                    TaskError::Cancelled => {
                        self.cancelled.fetch_add(1, Ordering::Relaxed);
                    }
                    TaskError::Rejected(_) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                self.failed.fetch_add(1, Ordering::Release);
            }
        }
    }

    /// Add execution time of work that ran and failed.
    pub fn add_elapsed(&self, elapsed: Duration) {
        self.total_elapsed_us
            .fetch_add(duration_micros(elapsed), Ordering::Relaxed);
    }

    /// `in_flight` is derived, so `submitted == completed + failed + in_flight`
    /// holds for every snapshot even while work is moving.
    pub fn snapshot(&self, class: WorkloadClass, config: &WorkerPoolConfig) -> ClassStats {
        let completed = self.completed.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        // Read after the terminal counters so it can never lag them.
        let submitted = self
            .submitted
            .load(Ordering::Acquire)
            .max(completed + failed);
        ClassStats {
            class,
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            submitted,
            completed,
            failed,
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            caller_runs: self.caller_runs.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            in_flight: submitted - completed - failed,
            queued: self.queued.load(Ordering::Relaxed),
            total_elapsed_us: self.total_elapsed_us.load(Ordering::Relaxed),
        }
    }
}

/// Worker threads and bounded queue for a single workload class.
pub(crate) struct ClassPool {
    class: WorkloadClass,
    config: WorkerPoolConfig,
    /// Sender side; `None` once the pool is closed.
    task_tx: Mutex<Option<Sender<WorkItem>>>,
    /// Kept so shutdown can drain what workers never reached.
    task_rx: Receiver<WorkItem>,
    pub(crate) counters: Arc<ClassCounters>,
    abort: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClassPool {
    pub(crate) fn new(class: WorkloadClass, config: WorkerPoolConfig) -> Result<Self, ConfigError> {
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("{class} pool: {e}")))?;

        let (task_tx, task_rx) = bounded::<WorkItem>(config.queue_capacity);
        let counters = Arc::new(ClassCounters::default());
        let abort = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = spawn_worker(
                class,
                worker_id,
                task_rx.clone(),
                Arc::clone(&counters),
                Arc::clone(&abort),
                config.thread_stack_size,
            )
            .map_err(|e| ConfigError::WorkerSpawn(e.to_string()))?;
            workers.push(worker);
        }

        info!(
            class = %class,
            worker_count = config.worker_count,
            queue_capacity = config.queue_capacity,
            backpressure = ?config.backpressure,
            "class pool started"
        );

        Ok(Self {
            class,
            config,
            task_tx: Mutex::new(Some(task_tx)),
            task_rx,
            counters,
            abort,
            workers: Mutex::new(workers),
        })
    }

    pub(crate) const fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Offer an item to the queue without blocking.
    pub(crate) fn offer(&self, item: WorkItem) -> Admission {
        let guard = self.task_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Admission::Closed(item);
        };
        // Count before the send so a fast worker never decrements below zero.
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(item) {
            Ok(()) => Admission::Queued,
            Err(TrySendError::Full(item)) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                Admission::Full(item)
            }
            Err(TrySendError::Disconnected(item)) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                Admission::Closed(item)
            }
        }
    }

    /// Block until the item is queued or the pool closes.
    ///
    /// The sender is re-taken every slice so a concurrent `close` still
    /// disconnects the queue within `RELAY_SLICE`.
    pub(crate) fn send_until_closed(&self, mut item: WorkItem) {
        loop {
            let sender = self.task_tx.lock().clone();
            let Some(tx) = sender else {
                item.abandon(TaskError::Shutdown);
                return;
            };
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            match tx.send_timeout(item, RELAY_SLICE) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) => {
                    self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(back)) => {
                    self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                    back.abandon(TaskError::Shutdown);
                    return;
                }
            }
        }
    }

    pub(crate) fn stats(&self) -> ClassStats {
        self.counters.snapshot(self.class, &self.config)
    }

    /// Stop accepting work. Workers drain the queue and exit.
    pub(crate) fn close(&self) {
        self.task_tx.lock().take();
    }

    /// Join workers until `deadline`. Returns how many were still running.
    pub(crate) fn join_until(&self, deadline: Instant) -> usize {
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let total = workers.len();
        if total == 0 {
            return 0;
        }

        let (done_tx, done_rx) = bounded::<bool>(total);
        for worker in workers {
            let done_tx = done_tx.clone();
            // A joiner per worker so a stuck one cannot hold up the others.
            thread::spawn(move || {
                let _ = done_tx.send(worker.join().is_ok());
            });
        }
        drop(done_tx);

        let mut joined = 0;
        while joined < total {
            match done_rx.recv_deadline(deadline) {
                Ok(clean) => {
                    if !clean {
                        warn!(class = %self.class, "worker panicked");
                    }
                    joined += 1;
                }
                Err(_) => break,
            }
        }
        total - joined
    }

    /// Cancel everything still queued and tell workers to skip what they pick up next.
    pub(crate) fn abort(&self) -> u64 {
        self.abort.store(true, Ordering::Release);
        let mut cancelled = 0;
        while let Ok(item) = self.task_rx.try_recv() {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            item.abandon(TaskError::Cancelled);
            cancelled += 1;
        }
        if cancelled > 0 {
            info!(class = %self.class, cancelled, "cancelled queued work at shutdown");
        }
        cancelled
    }
}

/// Longest a relayed send waits before re-checking whether its pool closed.
const RELAY_SLICE: Duration = Duration::from_millis(50);

type RelayJob = (Arc<ClassPool>, WorkItem);

/// Thread that finishes admission for work the timer thread could not queue.
///
/// The timer thread never blocks and never runs work: when a queue is full it
/// hands the item here, and the relay waits for room on its behalf.
pub(crate) struct Relay {
    tx: Mutex<Option<Sender<RelayJob>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    pub(crate) fn start() -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<RelayJob>();
        let thread = thread::Builder::new()
            .name("switchyard-relay".into())
            .spawn(move || {
                while let Ok((pool, item)) = rx.recv() {
                    pool.send_until_closed(item);
                }
                debug!("relay thread exiting");
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue `item` for `pool` from a thread that must not block.
    pub(crate) fn hand_off(&self, pool: Arc<ClassPool>, item: WorkItem) {
        let sender = self.tx.lock().clone();
        let Some(tx) = sender else {
            item.abandon(TaskError::Shutdown);
            return;
        };
        pool.counters.relayed.fetch_add(1, Ordering::Relaxed);
        if let Err(SendError((_, item))) = tx.send((pool, item)) {
            item.abandon(TaskError::Shutdown);
        }
    }

    /// Stop taking hand-offs. Anything already handed off is still delivered
    /// or, if its pool has closed, settled as `Shutdown`.
    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }

    /// Close and wait for the relay thread to finish what it holds.
    pub(crate) fn stop(&self) {
        self.close();
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

fn spawn_worker(
    class: WorkloadClass,
    worker_id: usize,
    task_rx: Receiver<WorkItem>,
    counters: Arc<ClassCounters>,
    abort: Arc<AtomicBool>,
    stack_size: usize,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("switchyard-{class}-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(class = %class, worker_id, "worker started");
            // recv fails once the sender is dropped and the queue is drained.
            while let Ok(item) = task_rx.recv() {
                counters.queued.fetch_sub(1, Ordering::Relaxed);
                if abort.load(Ordering::Acquire) {
                    item.abandon(TaskError::Cancelled);
                    continue;
                }
                item.run();
            }
            debug!(class = %class, worker_id, "worker exiting");
        })
}
