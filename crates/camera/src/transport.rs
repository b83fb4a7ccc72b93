//! Raw USB transport abstraction
//!
//! The engine never talks to a USB stack directly. Everything it needs
//! (descriptor enumeration, control transfers, interface claiming and
//! asynchronous receive requests) goes through [`Transport`], which is
//! implemented over libusb by [`crate::rusb_transport::RusbTransport`] and
//! in memory by [`crate::test_utils::MockTransport`].

use protocol::DescriptorBlock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure status of a USB operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbStatus {
    #[error("transfer timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Pipe,
    #[error("device disconnected")]
    NoDevice,
    #[error("entity not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("buffer overflow")]
    Overflow,
    #[error("I/O error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied")]
    Access,
    #[error("request cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

/// Setup packet of a control transfer (data length comes from the buffer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Whether data flows from device to host
    pub fn is_read(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

impl fmt::Display for ControlSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={:#04x} req={:#04x} value={:#06x} index={:#06x}",
            self.request_type, self.request, self.value, self.index
        )
    }
}

/// Identifies an outstanding receive request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(pub u64);

/// What the transport does with a request after its completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// Submit the same request again immediately
    Resubmit,
    /// Retire the request
    Release,
}

/// Receives completions of asynchronous requests
///
/// Called on a transport-owned thread. Implementations must not block.
pub trait CompletionHandler: Send + Sync {
    fn on_complete(&self, result: Result<&[u8], UsbStatus>) -> RequestAction;
}

/// Raw USB primitives the engine is built on
pub trait Transport: Send + Sync {
    /// All descriptor blocks of the active configuration, in device order
    fn enumerate_descriptors(&self) -> Result<Vec<DescriptorBlock>, UsbStatus>;

    /// Run a control transfer; returns the number of bytes transferred
    fn control_transfer(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbStatus>;

    /// Claim an interface for exclusive use
    fn open_interface(&self, interface: u8) -> Result<(), UsbStatus>;

    /// Release a previously claimed interface
    fn close_interface(&self, interface: u8) -> Result<(), UsbStatus>;

    /// Start an asynchronous receive of up to `buffer_len` bytes on `endpoint`
    ///
    /// The request stays outstanding for as long as the handler answers
    /// [`RequestAction::Resubmit`].
    fn submit_request(
        &self,
        endpoint: u8,
        buffer_len: usize,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<RequestHandle, UsbStatus>;

    /// Retire a request, waiting for a completion callback already in progress
    ///
    /// After this returns the handler is never called again for `handle`.
    fn cancel_request(&self, handle: RequestHandle);

    /// Whether the device is still present on the bus
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_direction() {
        let get = ControlSetup {
            request_type: 0xa1,
            request: 0x81,
            value: 0x0100,
            index: 1,
        };
        assert!(get.is_read());
        assert!(!ControlSetup { request_type: 0x21, ..get }.is_read());
        assert_eq!(
            get.to_string(),
            "type=0xa1 req=0x81 value=0x0100 index=0x0001"
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(UsbStatus::NoDevice.to_string(), "device disconnected");
        assert_eq!(UsbStatus::Other("weird".into()).to_string(), "weird");
    }
}
