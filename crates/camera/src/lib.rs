//! UVC streaming engine
//!
//! Drives a USB Video Class camera from power-up to frames: descriptors are
//! parsed once at D0, a profile is negotiated through Probe/Commit, and
//! payloads from the streaming endpoint are reassembled into [`Frame`]s
//! delivered on a publisher thread. A watchdog clears stalled endpoints.
//!
//! All device operations are serialized through one dispatcher thread per
//! [`UvcDevice`].

pub mod buffers;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod frame;
pub mod negotiator;
pub mod rusb_transport;
pub mod streamer;
pub mod test_utils;
pub mod transport;

pub use config::EngineConfig;
pub use device::{ControlRange, PowerState, UvcDevice};
pub use error::{CameraError, Result};
pub use frame::Frame;
pub use negotiator::{NegotiationState, Negotiated, StreamNegotiator};
pub use rusb_transport::{RusbTransport, VideoDeviceInfo, list_video_devices};
pub use streamer::{ErrorHandler, FrameCallback, StreamStats, UvcStreamer};
pub use transport::{
    CompletionHandler, ControlSetup, RequestAction, RequestHandle, Transport, UsbStatus,
};
