//! UVC wire formats for uvc-stream
//!
//! This crate holds everything about the USB Video Class that can be
//! expressed without threads or I/O: descriptor parsing, pixel format codes,
//! stream profile derivation, the Probe/Commit control block codec and
//! payload header decoding.
//!
//! # Example
//!
//! ```
//! use protocol::test_utils::simple_camera;
//! use protocol::{ControlBlockLength, StreamProfile, find_profile, parse_descriptors};
//!
//! let parsed = parse_descriptors(&simple_camera(0x0100), 0);
//! let profile: StreamProfile = "YUY2:640x480@30".parse().unwrap();
//!
//! let matched = find_profile(&parsed, &profile).unwrap();
//! assert_eq!(matched.frame_interval, 333_333);
//! assert_eq!(ControlBlockLength::for_version(parsed.control.bcd_uvc).len(), 26);
//! ```

pub mod constants;
pub mod control;
pub mod descriptors;
pub mod error;
pub mod fourcc;
pub mod payload;
pub mod profile;
pub mod test_utils;

pub use constants::{RequestCode, VcSubtype, VsControlSelector, VsSubtype};
pub use control::{ControlBlockLength, HINT_FRAME_INTERVAL, StreamControlBlock};
pub use descriptors::{
    ControlInterface, DescriptorBlock, DeviceDescriptors, ExtensionUnit, FormatDescriptor,
    FormatKind, FrameDescriptor, FrameIntervals, InputTerminal, ProcessingUnit, SelectorUnit,
    StreamingInterface, parse_descriptors, split_descriptors,
};
pub use error::{ProtocolError, Result};
pub use fourcc::FourCc;
pub use payload::{MAX_PAYLOAD_HEADER_LEN, PayloadHeader};
pub use profile::{ProfileMatch, StreamProfile, derive_profiles, find_profile};
