//! Stall detector
//!
//! The owner kicks the watchdog whenever progress is made. If no kick lands
//! within the timeout the operation fires once; it is re-armed by the next
//! kick, so a long stall produces a single firing rather than one per period.
//!
//! Each watchdog owns its timer thread, and `stop` joins it, so the operation
//! never runs once `stop` has returned.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Bounds on how often the watchdog thread checks for a stall
const MIN_POLL: Duration = Duration::from_millis(1);
const MAX_POLL: Duration = Duration::from_millis(100);

type Operation = Box<dyn Fn() + Send + Sync + 'static>;

struct WatchdogInner {
    epoch: Instant,
    last_kick_ns: AtomicU64,
    armed: AtomicBool,
    timeout_ns: AtomicU64,
    fire_count: AtomicU64,
    stop: Mutex<bool>,
    stop_signal: Condvar,
    operation: Operation,
}

impl WatchdogInner {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_ns.load(Ordering::Relaxed))
    }

    fn is_stopping(&self) -> bool {
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block for one poll period; false once stop was requested
    fn wait_poll(&self, poll: Duration) -> bool {
        let guard = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .stop_signal
            .wait_timeout_while(guard, poll, |stop| !*stop)
            .unwrap_or_else(PoisonError::into_inner);
        !*guard
    }

    fn check(&self) {
        let idle = self
            .now_ns()
            .saturating_sub(self.last_kick_ns.load(Ordering::Acquire));
        if Duration::from_nanos(idle) < self.timeout() {
            return;
        }
        if !self.armed.swap(false, Ordering::AcqRel) {
            return;
        }

        let count = self.fire_count.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Watchdog fired after {:?} without a kick (firing #{})",
            Duration::from_nanos(idle),
            count
        );
        if let Err(e) = catch_unwind(AssertUnwindSafe(|| (self.operation)())) {
            error!("Panic in watchdog operation: {:?}", e);
        }
    }
}

/// Timer that runs an operation when it stops being kicked
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new<F>(timeout: Duration, operation: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(WatchdogInner {
                epoch: Instant::now(),
                last_kick_ns: AtomicU64::new(0),
                armed: AtomicBool::new(true),
                timeout_ns: AtomicU64::new(timeout.as_nanos() as u64),
                fire_count: AtomicU64::new(0),
                stop: Mutex::new(false),
                stop_signal: Condvar::new(),
                operation: Box::new(operation),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start watching; the timeout counts from now
    pub fn start(&self) {
        let mut thread_slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread_slot.is_some() {
            return;
        }

        *self.inner.stop.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.kick();

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("uvc-watchdog".to_string())
            .spawn(move || {
                while !inner.is_stopping() {
                    let poll = (inner.timeout() / 4).clamp(MIN_POLL, MAX_POLL);
                    if !inner.wait_poll(poll) {
                        break;
                    }
                    inner.check();
                }
            })
            .expect("Failed to spawn watchdog thread");

        *thread_slot = Some(handle);
        debug!("Watchdog started with timeout {:?}", self.inner.timeout());
    }

    /// Stop watching and wait for the watchdog thread to exit
    pub fn stop(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        *self.inner.stop.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.inner.stop_signal.notify_all();

        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Watchdog thread panicked");
        }
        debug!("Watchdog stopped");
    }

    /// Record progress and re-arm
    pub fn kick(&self) {
        self.inner
            .last_kick_ns
            .store(self.inner.now_ns(), Ordering::Release);
        self.inner.armed.store(true, Ordering::Release);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner
            .timeout_ns
            .store(timeout.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Times the operation has fired since creation
    pub fn fire_count(&self) -> u64 {
        self.inner.fire_count.load(Ordering::Relaxed)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
