//! Frame reassembly and delivery for one negotiated stream
//!
//! A [`UvcStreamer`] keeps `request_count` receive requests outstanding on
//! the stream's read endpoint. Each completion runs on a transport thread:
//! the payload header is validated, the payload is copied into a pooled
//! buffer and the resulting [`Frame`] is pushed onto a bounded queue. A
//! dedicated publisher thread drains that queue into the application's
//! callback. A [`Watchdog`] clears the endpoint halt if completions stop
//! producing frames.
//!
//! Completions never block: an exhausted pool or an invalid payload drops
//! the data and the request goes straight back to the transport.

use crate::buffers::FramePool;
use crate::config::StreamingSettings;
use crate::control::ControlChannel;
use crate::error::{CameraError, Result};
use crate::frame::Frame;
use crate::negotiator::Negotiated;
use crate::transport::{CompletionHandler, RequestAction, RequestHandle, Transport, UsbStatus};
use common::{BoundedQueue, Dispatcher, Watchdog};
use protocol::{PayloadHeader, StreamProfile};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Receives every published frame, on the publisher thread
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Receives stream errors that have no synchronous caller
pub type ErrorHandler = Arc<dyn Fn(CameraError) + Send + Sync>;

/// Snapshot of a stream's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Completed transfers carrying data
    pub received: u64,
    /// Frames handed to the callback
    pub published: u64,
    /// Payloads rejected by header or size validation
    pub dropped_invalid: u64,
    /// Valid payloads discarded because every buffer was held
    pub dropped_no_buffer: u64,
    /// Frames evicted from the publish queue before delivery
    pub queue_evictions: u64,
    /// Endpoint resets issued by the watchdog
    pub watchdog_resets: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    published: AtomicU64,
    dropped_invalid: AtomicU64,
    dropped_no_buffer: AtomicU64,
    watchdog_resets: AtomicU64,
}

/// State shared between the streamer, transport threads, the publisher and the watchdog
struct StreamShared {
    profile: StreamProfile,
    endpoint: u8,
    variable_size: bool,
    max_video_frame_size: usize,
    running: AtomicBool,
    delivering: AtomicBool,
    disconnect_reported: AtomicBool,
    sequence: AtomicU64,
    pool: FramePool,
    queue: BoundedQueue<Frame>,
    watchdog: Watchdog,
    counters: Counters,
    error_handler: Mutex<Option<ErrorHandler>>,
}

impl StreamShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn report(&self, err: CameraError) {
        let handler = self
            .error_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
                    error!("Panic in error handler for {}", self.profile);
                }
            }
            None => warn!("Unhandled stream error on {}: {}", self.profile, err),
        }
    }

    fn drop_invalid(&self, reason: &dyn std::fmt::Display) {
        let total = self.counters.dropped_invalid.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Dropping payload on {:#04x}: {} ({} dropped)",
            self.endpoint, reason, total
        );
    }

    /// Validate one payload and queue it as a frame
    fn reassemble(&self, payload: &[u8]) {
        let header = match PayloadHeader::parse(payload) {
            Ok(header) => header,
            Err(e) => {
                self.drop_invalid(&e);
                return;
            }
        };

        if header.has_error() {
            self.drop_invalid(&"error bit set in payload header");
            return;
        }

        if self.variable_size {
            if payload.len() > self.pool.buffer_size() {
                self.drop_invalid(&format!(
                    "{} bytes exceed buffer size {}",
                    payload.len(),
                    self.pool.buffer_size()
                ));
                return;
            }
        } else if payload.len() != header.length + self.max_video_frame_size {
            self.drop_invalid(&format!(
                "{} bytes, expected {} header + {} frame",
                payload.len(),
                header.length,
                self.max_video_frame_size
            ));
            return;
        }

        // A valid payload is progress even when no buffer is free to keep it
        self.watchdog.kick();

        let Some(mut buffer) = self.pool.acquire() else {
            let total = self.counters.dropped_no_buffer.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                "No free frame buffer on {}, dropping payload ({} dropped)",
                self.profile, total
            );
            return;
        };
        buffer.fill(payload);

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(
            self.profile,
            sequence,
            header.length,
            header.pts(payload),
            buffer,
        );
        if self.queue.enqueue(frame) {
            trace!("Queued frame {} of {}", sequence, self.profile);
        }
    }
}

impl CompletionHandler for StreamShared {
    fn on_complete(&self, result: std::result::Result<&[u8], UsbStatus>) -> RequestAction {
        if !self.is_running() {
            return RequestAction::Release;
        }

        match result {
            Ok(payload) => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                self.reassemble(payload);
                RequestAction::Resubmit
            }
            Err(UsbStatus::Cancelled) => RequestAction::Release,
            Err(UsbStatus::NoDevice) => {
                if !self.disconnect_reported.swap(true, Ordering::AcqRel) {
                    warn!("Device disconnected while streaming {}", self.profile);
                    self.report(CameraError::DeviceDisconnected);
                }
                RequestAction::Release
            }
            Err(status) => {
                trace!("Receive on {:#04x} failed: {}", self.endpoint, status);
                RequestAction::Resubmit
            }
        }
    }
}

/// Watchdog action: reset the endpoint through the dispatcher
fn stall_recovery(
    stream: Weak<StreamShared>,
    dispatcher: Weak<Dispatcher>,
    control: ControlChannel,
) -> impl Fn() + Send + Sync + 'static {
    move || {
        let Some(shared) = stream.upgrade() else {
            return;
        };
        if !shared.is_running() {
            return;
        }
        let Some(dispatcher) = dispatcher.upgrade() else {
            return;
        };

        shared.counters.watchdog_resets.fetch_add(1, Ordering::Relaxed);
        warn!(
            "No frames on {} for {:?}, resetting endpoint {:#04x}",
            shared.profile,
            shared.watchdog.timeout(),
            shared.endpoint
        );

        let endpoint = shared.endpoint;
        let control = control.clone();
        let stream = stream.clone();
        dispatcher.invoke(move |_| {
            let Some(shared) = stream.upgrade() else {
                return;
            };
            if !shared.is_running() {
                return;
            }
            if let Err(e) = control.clear_halt(endpoint) {
                error!("Failed to reset endpoint {:#04x}: {}", endpoint, e);
                shared.report(e);
            }
        });
    }
}

fn run_publisher(shared: Arc<StreamShared>, callback: FrameCallback, timeout: Duration) {
    while shared.is_running() {
        let Some(frame) = shared.queue.dequeue(timeout) else {
            continue;
        };
        if !shared.delivering.load(Ordering::Acquire) {
            trace!("Callbacks paused, discarding frame {}", frame.sequence());
            continue;
        }

        let sequence = frame.sequence();
        if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
            error!("Panic in frame callback for {} (frame {})", shared.profile, sequence);
        }
        shared.counters.published.fetch_add(1, Ordering::Relaxed);
    }
    trace!("Publisher for {} exiting", shared.profile);
}

/// One streaming session on one read endpoint
pub struct UvcStreamer {
    shared: Arc<StreamShared>,
    transport: Arc<dyn Transport>,
    callback: FrameCallback,
    request_count: usize,
    publish_timeout: Duration,
    requests: Vec<RequestHandle>,
    publisher: Option<JoinHandle<()>>,
}

impl UvcStreamer {
    pub fn new(
        negotiated: &Negotiated,
        callback: FrameCallback,
        settings: &StreamingSettings,
        control: ControlChannel,
        dispatcher: Weak<Dispatcher>,
    ) -> Self {
        let target = &negotiated.profile_match;
        let block = &negotiated.control;

        let frame_size = (block.max_video_frame_size as usize).max(target.max_frame_buffer_size as usize);
        let buffer_size = frame_size + settings.payload_header_allowance;

        let interval = if block.frame_interval != 0 {
            block.frame_interval
        } else {
            target.frame_interval
        };
        let watchdog_timeout = Duration::from_nanos(interval as u64 * 100) * settings.watchdog_multiplier;

        let transport = Arc::clone(control.transport());
        let shared = Arc::new_cyclic(|weak: &Weak<StreamShared>| StreamShared {
            profile: target.profile,
            endpoint: target.endpoint_address,
            variable_size: target.variable_size,
            max_video_frame_size: block.max_video_frame_size as usize,
            running: AtomicBool::new(false),
            delivering: AtomicBool::new(true),
            disconnect_reported: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            pool: FramePool::new(settings.request_count, buffer_size),
            queue: BoundedQueue::new(settings.queue_capacity),
            watchdog: Watchdog::new(
                watchdog_timeout,
                stall_recovery(weak.clone(), dispatcher, control),
            ),
            counters: Counters::default(),
            error_handler: Mutex::new(None),
        });

        debug!(
            "Streamer for {} on {:#04x}: {} x {} byte buffers, watchdog {:?}",
            target.profile, target.endpoint_address, settings.request_count, buffer_size, watchdog_timeout
        );

        Self {
            shared,
            transport,
            callback,
            request_count: settings.request_count,
            publish_timeout: settings.publish_timeout(),
            requests: Vec::new(),
            publisher: None,
        }
    }

    pub fn profile(&self) -> &StreamProfile {
        &self.shared.profile
    }

    pub fn endpoint(&self) -> u8 {
        self.shared.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Submit every receive request and start the publisher and watchdog
    pub fn start(&mut self, error_handler: Option<ErrorHandler>) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        *self
            .shared
            .error_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error_handler;
        self.shared.disconnect_reported.store(false, Ordering::Release);
        self.shared.queue.start();
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let callback = Arc::clone(&self.callback);
        let timeout = self.publish_timeout;
        self.publisher = Some(
            thread::Builder::new()
                .name("uvc-publisher".to_string())
                .spawn(move || run_publisher(shared, callback, timeout))
                .expect("Failed to spawn publisher thread"),
        );

        let handler: Arc<dyn CompletionHandler> = self.shared.clone();
        let buffer_size = self.shared.pool.buffer_size();
        for _ in 0..self.request_count {
            match self
                .transport
                .submit_request(self.shared.endpoint, buffer_size, Arc::clone(&handler))
            {
                Ok(handle) => self.requests.push(handle),
                Err(status) => {
                    error!(
                        "Failed to submit request on {:#04x}: {}",
                        self.shared.endpoint, status
                    );
                    self.stop();
                    return Err(status.into());
                }
            }
        }

        self.shared.watchdog.start();
        info!(
            "Streaming {} with {} outstanding requests",
            self.shared.profile,
            self.requests.len()
        );
        Ok(())
    }

    /// Cancel all requests, then stop the watchdog and the publisher
    ///
    /// Returns once no completion or callback for this stream can still run.
    pub fn stop(&mut self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);

        for handle in self.requests.drain(..) {
            self.transport.cancel_request(handle);
        }
        self.shared.watchdog.stop();
        self.shared.queue.stop();

        if let Some(publisher) = self.publisher.take() {
            if publisher.thread().id() != thread::current().id() && publisher.join().is_err() {
                error!("Publisher thread for {} panicked", self.shared.profile);
            }
        }

        if was_running {
            info!("Stopped streaming {}", self.shared.profile);
        }
    }

    /// Resume handing frames to the callback
    pub fn enable_callbacks(&self) {
        self.shared.delivering.store(true, Ordering::Release);
    }

    /// Keep streaming but discard frames instead of calling back
    pub fn disable_callbacks(&self) {
        self.shared.delivering.store(false, Ordering::Release);
    }

    pub fn callbacks_enabled(&self) -> bool {
        self.shared.delivering.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StreamStats {
        let counters = &self.shared.counters;
        StreamStats {
            received: counters.received.load(Ordering::Relaxed),
            published: counters.published.load(Ordering::Relaxed),
            dropped_invalid: counters.dropped_invalid.load(Ordering::Relaxed),
            dropped_no_buffer: counters.dropped_no_buffer.load(Ordering::Relaxed),
            queue_evictions: self.shared.queue.evicted(),
            watchdog_resets: counters.watchdog_resets.load(Ordering::Relaxed),
        }
    }

    /// Buffers not currently held by queued or delivered frames
    pub fn free_buffers(&self) -> usize {
        self.shared.pool.available()
    }
}

impl Drop for UvcStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}
