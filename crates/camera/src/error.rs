//! Camera engine error types

use crate::device::PowerState;
use crate::transport::UsbStatus;
use protocol::{ProtocolError, StreamProfile};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CameraError {
    /// No exact (format, width, height, fps) match in the descriptor tables
    #[error("Format not supported: {0}")]
    FormatNotSupported(StreamProfile),

    /// A USB operation failed (after retries, for control transfers)
    #[error("USB transfer failed: {0}")]
    Transfer(UsbStatus),

    #[error("USB device disconnected")]
    DeviceDisconnected,

    #[error("Profile {0} is already streaming")]
    AlreadyStreaming(StreamProfile),

    #[error("No stream has been configured")]
    NotConfigured,

    #[error("Profile {0} is not configured")]
    NotStreaming(StreamProfile),

    #[error("Device must be in power state D0")]
    NotPowered,

    #[error("Failed to enter power state {state:?}: {reason}")]
    PowerState { state: PowerState, reason: String },

    /// The dispatcher was stopped or dropped the request
    #[error("Dispatcher unavailable")]
    DispatcherUnavailable,

    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<UsbStatus> for CameraError {
    fn from(status: UsbStatus) -> Self {
        match status {
            UsbStatus::NoDevice => CameraError::DeviceDisconnected,
            other => CameraError::Transfer(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::FourCc;

    #[test]
    fn test_no_device_maps_to_disconnect() {
        assert!(matches!(
            CameraError::from(UsbStatus::NoDevice),
            CameraError::DeviceDisconnected
        ));
        assert!(matches!(
            CameraError::from(UsbStatus::Pipe),
            CameraError::Transfer(UsbStatus::Pipe)
        ));
    }

    #[test]
    fn test_error_display() {
        let profile = StreamProfile::new(FourCc::YUYV, 640, 480, 30);
        let msg = CameraError::FormatNotSupported(profile).to_string();
        assert!(msg.contains("YUYV:640x480@30"));
    }
}
