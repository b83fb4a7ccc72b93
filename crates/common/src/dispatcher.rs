//! Serialized action dispatcher
//!
//! A [`Dispatcher`] owns one worker thread that drains a [`BoundedQueue`] of
//! boxed closures and runs each to completion before taking the next. Every
//! piece of state that is only touched from inside actions is therefore
//! mutated by a single thread, in submission order, without extra locking.
//!
//! # Stop semantics
//!
//! [`Dispatcher::stop`] refuses new actions, discards pending ones and waits
//! for the action currently executing (if any). Once it returns no action
//! runs until [`Dispatcher::start`] is called, even when several threads
//! call `stop` concurrently.
//!
//! # Example
//!
//! ```
//! use common::Dispatcher;
//!
//! let dispatcher = Dispatcher::new("example", 10);
//! let answer = dispatcher.invoke_and_wait(|_| 6 * 7, || false);
//! assert_eq!(answer, Some(42));
//! ```

use crate::queue::BoundedQueue;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Work item executed on the dispatcher thread
pub type Action = Box<dyn FnOnce(&CancellableTimer) + Send + 'static>;

/// How long the worker blocks on an empty queue before re-checking for exit
const WORKER_POLL: Duration = Duration::from_millis(50);

/// How often `invoke_and_wait` re-evaluates its exit predicate
const WAIT_POLL: Duration = Duration::from_millis(10);

struct Shared {
    stopped: Mutex<bool>,
    stop_signal: Condvar,
    /// Held by the worker while an action runs; `stop` takes it to wait one out
    dispatch_lock: Mutex<()>,
}

impl Shared {
    fn is_stopped(&self) -> bool {
        *lock(&self.stopped)
    }

    fn set_stopped(&self, stopped: bool) {
        *lock(&self.stopped) = stopped;
        self.stop_signal.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle given to running actions so long waits can bail out on stop
#[derive(Clone)]
pub struct CancellableTimer {
    shared: Arc<Shared>,
}

impl CancellableTimer {
    /// Whether the owning dispatcher has been stopped
    pub fn was_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Sleep for `duration` unless the dispatcher is stopped first
    ///
    /// Returns true if the full duration elapsed.
    pub fn try_sleep(&self, duration: Duration) -> bool {
        let guard = lock(&self.shared.stopped);
        let (guard, result) = self
            .shared
            .stop_signal
            .wait_timeout_while(guard, duration, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        result.timed_out() && !*guard
    }
}

enum Completion<R> {
    Pending,
    Done(R),
    Dropped,
}

type CompletionSlot<R> = Arc<(Mutex<Completion<R>>, Condvar)>;

/// Marks the slot `Dropped` if the action never completes (discarded or panicked)
struct CompletionGuard<R> {
    slot: CompletionSlot<R>,
}

impl<R> CompletionGuard<R> {
    fn complete(self, value: R) {
        let (state, signal) = &*self.slot;
        *lock(state) = Completion::Done(value);
        signal.notify_all();
    }
}

impl<R> Drop for CompletionGuard<R> {
    fn drop(&mut self) {
        let (state, signal) = &*self.slot;
        let mut state = lock(state);
        if matches!(*state, Completion::Pending) {
            *state = Completion::Dropped;
        }
        drop(state);
        signal.notify_all();
    }
}

/// Single-worker serialized executor
pub struct Dispatcher {
    name: String,
    queue: Arc<BoundedQueue<Action>>,
    shared: Arc<Shared>,
    exit: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Dispatcher {
    /// Spawn the worker thread; `capacity` bounds the pending action queue
    pub fn new(name: &str, capacity: usize) -> Self {
        let queue: Arc<BoundedQueue<Action>> = Arc::new(BoundedQueue::new(capacity));
        let shared = Arc::new(Shared {
            stopped: Mutex::new(false),
            stop_signal: Condvar::new(),
            dispatch_lock: Mutex::new(()),
        });
        let exit = Arc::new(AtomicBool::new(false));

        let worker = {
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&shared);
            let exit = Arc::clone(&exit);
            let thread_name = name.to_string();
            thread::Builder::new()
                .name(format!("{}-dispatcher", name))
                .spawn(move || run_worker(&thread_name, queue, shared, exit))
                .expect("Failed to spawn dispatcher thread")
        };

        debug!("Dispatcher '{}' started", name);

        Self {
            name: name.to_string(),
            worker_id: worker.thread().id(),
            queue,
            shared,
            exit,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an action; silently dropped if the dispatcher is stopped
    pub fn invoke<F>(&self, action: F)
    where
        F: FnOnce(&CancellableTimer) + Send + 'static,
    {
        if self.shared.is_stopped() {
            trace!("Dispatcher '{}' stopped, dropping action", self.name);
            return;
        }
        self.queue.enqueue(Box::new(action));
    }

    /// Queue an action and block until it finishes or `exit` returns true
    ///
    /// Returns the action's result, or `None` if the dispatcher was stopped,
    /// the action was discarded or panicked, or `exit` fired first. Called
    /// from the worker thread itself, the action runs inline.
    pub fn invoke_and_wait<F, R, P>(&self, action: F, exit: P) -> Option<R>
    where
        F: FnOnce(&CancellableTimer) -> R + Send + 'static,
        R: Send + 'static,
        P: Fn() -> bool,
    {
        if self.is_worker_thread() {
            return Some(action(&self.timer()));
        }
        if self.shared.is_stopped() {
            return None;
        }

        let slot: CompletionSlot<R> = Arc::new((Mutex::new(Completion::Pending), Condvar::new()));
        let guard = CompletionGuard {
            slot: Arc::clone(&slot),
        };
        self.invoke(move |timer| {
            let value = action(timer);
            guard.complete(value);
        });

        let (state, signal) = &*slot;
        let mut state = lock(state);
        loop {
            match std::mem::replace(&mut *state, Completion::Pending) {
                Completion::Done(value) => return Some(value),
                Completion::Dropped => return None,
                Completion::Pending => {}
            }
            if exit() {
                return None;
            }
            state = signal
                .wait_timeout(state, WAIT_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wait until every action queued before this call has run
    ///
    /// Returns false on timeout or if the dispatcher is stopped.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.invoke_and_wait(|_| (), || Instant::now() >= deadline)
            .is_some()
    }

    /// Refuse new actions, drop pending ones and wait for the running one
    pub fn stop(&self) {
        self.shared.set_stopped(true);
        let discarded = self.queue.len();
        self.queue.stop();

        // An action stopping its own dispatcher cannot wait for itself
        if !self.is_worker_thread() {
            drop(lock(&self.shared.dispatch_lock));
        }

        debug!(
            "Dispatcher '{}' stopped ({} pending action(s) discarded)",
            self.name, discarded
        );
    }

    /// Accept actions again after [`stop`](Self::stop)
    pub fn start(&self) {
        self.queue.start();
        self.shared.set_stopped(false);
        debug!("Dispatcher '{}' accepting actions", self.name);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Actions queued but not yet running
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the caller is running on this dispatcher's worker thread
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    fn timer(&self) -> CancellableTimer {
        CancellableTimer {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
        self.exit.store(true, Ordering::Release);

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if self.is_worker_thread() {
                // Dropped from inside an action; the worker exits on its own
                return;
            }
            if worker.join().is_err() {
                error!("Dispatcher '{}' worker thread panicked", self.name);
            }
        }
    }
}

fn run_worker(name: &str, queue: Arc<BoundedQueue<Action>>, shared: Arc<Shared>, exit: Arc<AtomicBool>) {
    let timer = CancellableTimer {
        shared: Arc::clone(&shared),
    };

    while !exit.load(Ordering::Acquire) {
        let Some(action) = queue.dequeue(WORKER_POLL) else {
            continue;
        };

        let _running = lock(&shared.dispatch_lock);
        if shared.is_stopped() {
            // Dequeued just before stop(); must not run
            drop(action);
            continue;
        }

        let result = catch_unwind(AssertUnwindSafe(|| action(&timer)));
        if let Err(e) = result {
            error!("Panic in dispatcher '{}' action: {:?}", name, e);
        }
    }

    trace!("Dispatcher '{}' worker exiting", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_invoke_runs_in_order() {
        let dispatcher = Dispatcher::new("order", 16);
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = Arc::clone(&log);
            dispatcher.invoke(move |_| log.lock().unwrap().push(i));
        }
        assert!(dispatcher.flush(Duration::from_secs(5)));
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_invoke_and_wait_returns_value() {
        let dispatcher = Dispatcher::new("value", 4);
        assert_eq!(dispatcher.invoke_and_wait(|_| "done", || false), Some("done"));
    }

    #[test]
    fn test_invoke_and_wait_exit_predicate() {
        let dispatcher = Dispatcher::new("exit", 4);
        let start = Instant::now();
        let result = dispatcher.invoke_and_wait(
            |timer| {
                timer.try_sleep(Duration::from_secs(10));
            },
            || true,
        );
        assert!(result.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_panicking_action_does_not_kill_worker() {
        let dispatcher = Dispatcher::new("panic", 4);
        let result: Option<()> = dispatcher.invoke_and_wait(|_| panic!("boom"), || false);
        assert!(result.is_none());
        assert_eq!(dispatcher.invoke_and_wait(|_| 1, || false), Some(1));
    }

    #[test]
    fn test_stop_then_invoke_never_runs() {
        let dispatcher = Dispatcher::new("stopped", 4);
        let ran = Arc::new(AtomicUsize::new(0));

        dispatcher.stop();
        let counter = Arc::clone(&ran);
        dispatcher.invoke(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(dispatcher.invoke_and_wait(|_| 1, || false), None);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_after_stop() {
        let dispatcher = Dispatcher::new("restart", 4);
        dispatcher.stop();
        dispatcher.start();
        assert_eq!(dispatcher.invoke_and_wait(|_| 2, || false), Some(2));
    }

    #[test]
    fn test_nested_invoke_and_wait_runs_inline() {
        let dispatcher = Arc::new(Dispatcher::new("nested", 4));
        let inner = Arc::clone(&dispatcher);
        let result = dispatcher.invoke_and_wait(
            move |_| inner.invoke_and_wait(|_| 5, || false),
            || false,
        );
        assert_eq!(result, Some(Some(5)));
    }

    #[test]
    fn test_try_sleep_cut_short_by_stop() {
        let dispatcher = Arc::new(Dispatcher::new("sleep", 4));
        let slept_fully = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&slept_fully);
        dispatcher.invoke(move |timer| {
            flag.store(timer.try_sleep(Duration::from_secs(10)), Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        dispatcher.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!slept_fully.load(Ordering::SeqCst));
    }
}
