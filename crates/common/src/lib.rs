//! Common runtime pieces for uvc-stream
//!
//! This crate provides the concurrency primitives every engine component
//! builds on: a drop-oldest bounded queue, a single-worker serialized
//! dispatcher and a stall watchdog, plus error handling and logging setup.

pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod queue;
pub mod test_utils;
pub mod watchdog;

pub use dispatcher::{Action, CancellableTimer, Dispatcher};
pub use error::{Error, Result};
pub use logging::{init_test_logging, setup_logging};
pub use queue::BoundedQueue;
pub use watchdog::Watchdog;
