//! Timer thread for delayed and periodic work.
//!
//! A single thread sleeps on a `Condvar` until the earliest deadline in a
//! min-heap. Timer actions are short: they hand real work to the scheduled
//! class pool (or settle a handle), so one thread serves every timer.

use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::util::panic_message;

/// Why a timer action is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fire {
    /// Its deadline arrived.
    Due,
    /// The scheduler stopped before the deadline.
    Shutdown,
}

pub(crate) type TimerAction = Box<dyn FnOnce(Fire) + Send>;

thread_local! {
    static ON_TIMER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is the timer thread.
pub(crate) fn on_timer_thread() -> bool {
    ON_TIMER_THREAD.with(Cell::get)
}

struct TimerEntry {
    due: Instant,
    seq: u64,
    action: TimerAction,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the max-heap yields the earliest deadline, FIFO among equals.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<TimerQueue>,
    wake: Condvar,
}

/// Delay-ordered timer queue with its own thread.
pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn start() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(TimerQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("switchyard-timer".into())
            .spawn(move || timer_loop(&worker_shared))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `action` on the timer thread at `due`. False if the scheduler is stopped.
    pub(crate) fn schedule_at(&self, due: Instant, action: TimerAction) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return false;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        let is_earliest = queue.heap.peek().is_none_or(|head| due < head.due);
        queue.heap.push(TimerEntry { due, seq, action });
        drop(queue);
        if is_earliest {
            self.shared.wake.notify_one();
        }
        true
    }

    pub(crate) fn schedule_after(&self, delay: Duration, action: TimerAction) -> bool {
        self.schedule_at(Instant::now() + delay, action)
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Stop the timer thread. Pending timers are invoked with `Fire::Shutdown`
    /// so nothing waiting on them is left hanging. Returns how many there were.
    pub(crate) fn stop(&self) -> usize {
        let pending = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return 0;
            }
            queue.shutdown = true;
            std::mem::take(&mut queue.heap)
        };
        self.shared.wake.notify_all();
        let dropped = pending.len();
        for entry in pending {
            fire(entry.action, Fire::Shutdown);
        }
        if let Some(thread) = self.thread.lock().take() {
            // Joining from the timer thread itself would deadlock.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
        debug!(dropped, "timer thread stopped");
        dropped
    }

    /// Signal the timer thread to exit without waiting for it.
    pub(crate) fn signal_stop(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wake.notify_all();
    }
}

fn timer_loop(shared: &Shared) {
    ON_TIMER_THREAD.with(|flag| flag.set(true));
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            break;
        }
        let now = Instant::now();
        let next_due = queue.heap.peek().map(|head| head.due);
        match next_due {
            None => shared.wake.wait(&mut queue),
            Some(due) if due <= now => {
                if let Some(entry) = queue.heap.pop() {
                    MutexGuard::unlocked(&mut queue, || fire(entry.action, Fire::Due));
                }
            }
            Some(due) => {
                let _ = shared.wake.wait_until(&mut queue, due);
            }
        }
    }
    let leftovers = std::mem::take(&mut queue.heap);
    drop(queue);
    for entry in leftovers {
        fire(entry.action, Fire::Shutdown);
    }
}

fn fire(action: TimerAction, reason: Fire) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| action(reason))) {
        error!(panic = %panic_message(payload.as_ref()), "timer action panicked");
    }
}

/// How a recurring schedule computes its next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cadence {
    /// Next run is due one period after the previous due time.
    FixedRate(Duration),
    /// Next run is due one delay after the previous run finished.
    FixedDelay(Duration),
}

impl Cadence {
    pub(crate) fn next_due(self, previous_due: Instant) -> Instant {
        match self {
            Self::FixedRate(period) => previous_due + period,
            Self::FixedDelay(delay) => Instant::now() + delay,
        }
    }
}

/// Shared state behind a `ScheduleHandle`.
#[derive(Debug, Default)]
pub(crate) struct ScheduleState {
    pub cancelled: AtomicBool,
    pub runs: AtomicU64,
    pub failures: AtomicU64,
}

/// Control handle for a recurring schedule.
///
/// A failing run is logged and counted but never unschedules the task; only
/// [`cancel`](Self::cancel) stops it.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    pub(crate) state: Arc<ScheduleState>,
}

impl ScheduleHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(ScheduleState::default()),
        }
    }

    /// Stop future runs. A run already executing finishes.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Whether `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Runs finished so far, successful or not.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.state.runs.load(Ordering::Acquire)
    }

    /// Runs that returned an error or panicked.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.state.failures.load(Ordering::Acquire)
    }
}
