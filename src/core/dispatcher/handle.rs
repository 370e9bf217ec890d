//! Completion slots and the caller-facing `Handle`.
//!
//! A `Completion` is shared between the worker that produces a result and the
//! handle that consumes it. The first terminal transition wins; every later
//! attempt to complete is a no-op, so each handle observes exactly one
//! terminal state. Waiting uses a `parking_lot::Condvar`, never polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::core::TaskError;

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, waiting for a worker.
    Submitted,
    /// A worker (or the submitting thread) is running it.
    Running,
    /// Finished with a value.
    Completed,
    /// Finished with an error or panic.
    Failed,
    /// Cancelled before it ran.
    Cancelled,
    /// Gave up waiting on it.
    TimedOut,
}

impl TaskState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Submitted | Self::Running)
    }

    fn of<T>(result: &Result<T, TaskError>) -> Self {
        match result {
            Ok(_) => Self::Completed,
            Err(TaskError::Cancelled) => Self::Cancelled,
            Err(TaskError::TimedOut(_)) => Self::TimedOut,
            Err(_) => Self::Failed,
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(Result<T, TaskError>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

struct Slot<T> {
    state: TaskState,
    result: Option<Result<T, TaskError>>,
    continuation: Option<Continuation<T>>,
}

/// Shared result slot for one unit of work.
pub(crate) struct Completion<T> {
    id: u64,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    cancel_requested: AtomicBool,
    cancel_hook: Mutex<Option<CancelHook>>,
}

impl<T: Send + 'static> Completion<T> {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            slot: Mutex::new(Slot {
                state: TaskState::Submitted,
                result: None,
                continuation: None,
            }),
            ready: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            cancel_hook: Mutex::new(None),
        })
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        self.slot.lock().state
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// `Submitted -> Running`. False if the work was cancelled or already settled.
    pub(crate) fn mark_running(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != TaskState::Submitted || self.is_cancel_requested() {
            return false;
        }
        slot.state = TaskState::Running;
        true
    }

    /// Settle with `result`. Returns false if already settled.
    pub(crate) fn complete(&self, result: Result<T, TaskError>) -> bool {
        let mut slot = self.slot.lock();
        if slot.state.is_terminal() {
            return false;
        }
        slot.state = TaskState::of(&result);
        if let Some(continuation) = slot.continuation.take() {
            drop(slot);
            continuation(result);
        } else {
            slot.result = Some(result);
            drop(slot);
            self.ready.notify_all();
        }
        true
    }

    /// Request cancellation. Settles as `Cancelled` only if the work has not started.
    ///
    /// The first request also runs the hook set by [`on_cancel`](Self::on_cancel).
    pub(crate) fn cancel(&self) -> bool {
        let first = !self.cancel_requested.swap(true, Ordering::AcqRel);
        let settled = self.state() == TaskState::Submitted && self.complete(Err(TaskError::Cancelled));
        if first {
            let hook = self.cancel_hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        settled
    }

    /// Run `f` when cancellation is first requested; immediately if it already was.
    pub(crate) fn on_cancel<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hook = self.cancel_hook.lock();
        if self.is_cancel_requested() {
            drop(hook);
            f();
        } else {
            *hook = Some(Box::new(f));
        }
    }

    /// Run `f` with the result once settled; immediately if it already is.
    pub(crate) fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(result) = slot.result.take() {
            drop(slot);
            f(result);
        } else {
            slot.continuation = Some(Box::new(f));
        }
    }

    fn wait(&self, deadline: Option<Instant>) -> Option<Result<T, TaskError>> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.result.take() {
                return Some(result);
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        return slot.result.take();
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
    }
}

/// Future result of work submitted to a `TaskDispatcher`.
///
/// Await it with [`join`](Self::join) (blocking), [`join_timeout`](Self::join_timeout),
/// [`try_join`](Self::try_join) or, with the `tokio-runtime` feature,
/// [`join_async`](Self::join_async). Chain follow-up work with `then`.
pub struct Handle<T> {
    pub(crate) inner: Arc<Completion<T>>,
}

impl<T: Send + 'static> Handle<T> {
    pub(crate) const fn from_completion(inner: Arc<Completion<T>>) -> Self {
        Self { inner }
    }

    /// Dispatcher-unique task id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.state()
    }

    /// Whether the work has reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Best-effort cancellation.
    ///
    /// Work that has not started is settled as `Cancelled` and will be skipped
    /// by its worker. Work already running finishes normally. Returns whether
    /// this call settled the handle.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Block until the work settles.
    ///
    /// # Errors
    ///
    /// The `TaskError` the work settled with.
    pub fn join(self) -> Result<T, TaskError> {
        self.inner
            .wait(None)
            .unwrap_or(Err(TaskError::Shutdown))
    }

    /// Block up to `timeout`. Gives the handle back if the work has not settled.
    ///
    /// # Errors
    ///
    /// `Err(self)` when `timeout` elapses first.
    pub fn join_timeout(self, timeout: Duration) -> Result<Result<T, TaskError>, Self> {
        match self.inner.wait(Some(Instant::now() + timeout)) {
            Some(result) => Ok(result),
            None => Err(self),
        }
    }

    /// Take the result if the work has settled, otherwise give the handle back.
    ///
    /// # Errors
    ///
    /// `Err(self)` while the work is still pending.
    pub fn try_join(self) -> Result<Result<T, TaskError>, Self> {
        let taken = self.inner.slot.lock().result.take();
        taken.ok_or(self)
    }

    /// Await the result from async code.
    ///
    /// The blocking wait moves onto tokio's blocking pool, so the async runtime's
    /// workers are never parked on the condvar.
    ///
    /// # Errors
    ///
    /// The `TaskError` the work settled with.
    #[cfg(feature = "tokio-runtime")]
    pub async fn join_async(self) -> Result<T, TaskError> {
        match tokio::task::spawn_blocking(move || self.join()).await {
            Ok(result) => result,
            Err(e) => Err(TaskError::Panicked(e.to_string())),
        }
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("state", &self.inner.slot.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_completion_wins() {
        let completion = Completion::<u32>::new(1);
        assert!(completion.complete(Ok(1)));
        assert!(!completion.complete(Ok(2)));
        assert!(!completion.complete(Err(TaskError::Cancelled)));
        let handle = Handle::from_completion(completion);
        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn test_cancel_only_before_running() {
        let queued = Completion::<()>::new(1);
        assert!(queued.cancel());
        assert!(!queued.mark_running());
        assert_eq!(queued.state(), TaskState::Cancelled);

        let running = Completion::<()>::new(2);
        assert!(running.mark_running());
        assert!(!running.cancel());
        assert_eq!(running.state(), TaskState::Running);
        assert!(running.complete(Ok(())));
    }

    #[test]
    fn test_cancel_hook_runs_once() {
        let outer = Completion::<()>::new(1);
        let inner = Completion::<()>::new(2);
        let linked = Arc::clone(&inner);
        outer.on_cancel(move || {
            linked.cancel();
        });
        assert!(outer.cancel());
        assert_eq!(inner.state(), TaskState::Cancelled);
        assert!(!outer.cancel());

        let late = Completion::<()>::new(3);
        late.cancel();
        let (tx, rx) = crossbeam_channel::bounded(1);
        late.on_cancel(move || {
            let _ = tx.send(());
        });
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_join_wakes_on_completion_from_another_thread() {
        let completion = Completion::<String>::new(7);
        let producer = Arc::clone(&completion);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete(Ok("done".into()));
        });
        let handle = Handle::from_completion(completion);
        assert_eq!(handle.join().unwrap(), "done");
        t.join().unwrap();
    }

    #[test]
    fn test_join_timeout_returns_handle() {
        let completion = Completion::<u8>::new(3);
        let handle = Handle::from_completion(Arc::clone(&completion));
        let handle = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        let handle = handle.try_join().unwrap_err();
        completion.complete(Ok(9));
        assert_eq!(handle.try_join().unwrap().unwrap(), 9);
    }

    #[test]
    fn test_continuation_receives_result() {
        let completion = Completion::<u8>::new(4);
        let (tx, rx) = crossbeam_channel::bounded(1);
        completion.on_complete(move |r| {
            let _ = tx.send(r.unwrap());
        });
        completion.complete(Ok(5));
        assert_eq!(rx.recv().unwrap(), 5);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Submitted.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::TimedOut.is_terminal());
        assert_eq!(TaskState::of::<()>(&Err(TaskError::TimedOut(Duration::ZERO))), TaskState::TimedOut);
    }
}
