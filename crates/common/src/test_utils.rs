//! Test utilities shared across crates
//!
//! # Example
//!
//! ```
//! use common::test_utils::{DEFAULT_TEST_TIMEOUT, wait_until};
//!
//! assert!(wait_until(DEFAULT_TEST_TIMEOUT, || true));
//! ```

use std::thread;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` every millisecond until it holds or `timeout` passes
///
/// Returns whether the condition was observed to hold.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_wait_until_times_out() {
        let start = Instant::now();
        assert!(!wait_until(Duration::from_millis(20), || false));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_until_observes_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.store(true, Ordering::SeqCst);
        });
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || flag.load(Ordering::SeqCst)));
        handle.join().unwrap();
    }
}
