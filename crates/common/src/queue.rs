//! Bounded drop-oldest queue for cross-thread handoff
//!
//! Producers never block: once the queue holds `capacity` items the oldest
//! one is evicted to make room. Consumers block up to a timeout. Stopping
//! the queue clears it and makes it refuse new items until restarted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

struct QueueState<T> {
    items: VecDeque<T>,
    accepting: bool,
}

/// Fixed-capacity FIFO shared between threads
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: usize,
    evicted: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create an accepting queue; a zero capacity is treated as one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                accepting: true,
            }),
            available: Condvar::new(),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, evicting the oldest one when full
    ///
    /// Returns false (and drops the item) if the queue is stopped.
    pub fn enqueue(&self, item: T) -> bool {
        let evicted = {
            let mut state = self.lock();
            if !state.accepting {
                return false;
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item);
            evicted
        };
        self.available.notify_one();

        if evicted.is_some() {
            let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            trace!("Queue full, evicted oldest item (total evicted: {})", total);
        }
        // Evicted item is dropped here, outside the lock
        true
    }

    /// Remove the oldest item, waiting up to `timeout` for one to arrive
    ///
    /// Returns `None` on timeout or once the queue is stopped and empty.
    pub fn dequeue(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if !state.accepting {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Remove the oldest item without waiting
    pub fn try_dequeue(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Discard every queued item, returning how many were dropped
    pub fn clear(&self) -> usize {
        let drained: Vec<T> = self.lock().items.drain(..).collect();
        drained.len()
    }

    /// Refuse new items, discard queued ones and wake blocked consumers
    pub fn stop(&self) {
        let drained: Vec<T> = {
            let mut state = self.lock();
            state.accepting = false;
            state.items.drain(..).collect()
        };
        self.available.notify_all();
        drop(drained);
    }

    /// Accept items again after [`stop`](Self::stop)
    pub fn start(&self) {
        self.lock().accepting = true;
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted by overflow since creation
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
