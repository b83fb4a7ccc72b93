//! Retrying control-transfer channel
//!
//! Every class-specific request the engine issues goes through
//! [`ControlChannel`], which retries transient failures a fixed number of
//! times and turns a vanished device into [`CameraError::DeviceDisconnected`]
//! immediately.

use crate::error::{CameraError, Result};
use crate::transport::{ControlSetup, Transport, UsbStatus};
use protocol::RequestCode;
use protocol::constants::{FEATURE_ENDPOINT_HALT, REQ_CLEAR_FEATURE, REQ_TYPE_ENDPOINT_STANDARD};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Cloneable handle for issuing control transfers on one device
#[derive(Clone)]
pub struct ControlChannel {
    transport: Arc<dyn Transport>,
    retries: u32,
    timeout: Duration,
}

impl ControlChannel {
    /// `retries` counts attempts made after the first one fails
    pub fn new(transport: Arc<dyn Transport>, retries: u32, timeout: Duration) -> Self {
        Self {
            transport,
            retries,
            timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run one control transfer, retrying on failure
    pub fn transfer(&self, setup: ControlSetup, data: &mut [u8]) -> Result<usize> {
        let mut last = UsbStatus::Other("no attempt made".to_string());

        for attempt in 0..=self.retries {
            match self.transport.control_transfer(setup, data, self.timeout) {
                Ok(len) => {
                    trace!("Control transfer {} -> {} bytes", setup, len);
                    return Ok(len);
                }
                Err(UsbStatus::NoDevice) => {
                    warn!("Control transfer {}: device disconnected", setup);
                    return Err(CameraError::DeviceDisconnected);
                }
                Err(status) => {
                    debug!(
                        "Control transfer {} failed (attempt {}/{}): {}",
                        setup,
                        attempt + 1,
                        self.retries + 1,
                        status
                    );
                    last = status;
                }
            }
        }

        warn!(
            "Control transfer {} failed after {} attempts: {}",
            setup,
            self.retries + 1,
            last
        );
        Err(CameraError::Transfer(last))
    }

    /// Issue a GET request and return exactly `len` bytes
    pub fn get(&self, request: RequestCode, value: u16, index: u16, len: usize) -> Result<Vec<u8>> {
        let setup = ControlSetup {
            request_type: request.request_type(),
            request: request as u8,
            value,
            index,
        };
        let mut buf = vec![0u8; len];
        let read = self.transfer(setup, &mut buf)?;
        if read < len {
            return Err(CameraError::InsufficientData {
                expected: len,
                actual: read,
            });
        }
        Ok(buf)
    }

    /// Issue a SET_CUR request with `data` as payload
    pub fn set(&self, value: u16, index: u16, data: &[u8]) -> Result<()> {
        let setup = ControlSetup {
            request_type: RequestCode::SetCur.request_type(),
            request: RequestCode::SetCur as u8,
            value,
            index,
        };
        let mut buf = data.to_vec();
        self.transfer(setup, &mut buf)?;
        Ok(())
    }

    /// Clear a halt condition on `endpoint` (standard CLEAR_FEATURE)
    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        let setup = ControlSetup {
            request_type: REQ_TYPE_ENDPOINT_STANDARD,
            request: REQ_CLEAR_FEATURE,
            value: FEATURE_ENDPOINT_HALT,
            index: endpoint as u16,
        };
        self.transfer(setup, &mut [])?;
        debug!("Cleared halt on endpoint {:#04x}", endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use protocol::test_utils::simple_camera;

    fn channel(mock: &Arc<MockTransport>, retries: u32) -> ControlChannel {
        ControlChannel::new(mock.clone(), retries, Duration::from_millis(10))
    }

    #[test]
    fn test_retries_then_succeeds() {
        let mock = Arc::new(MockTransport::new(simple_camera(0x0100)));
        mock.fail_next_transfers(3, UsbStatus::Pipe);

        let control = channel(&mock, 5);
        control.set(0x0100, 1, &[0u8; 26]).unwrap();
        assert_eq!(mock.control_log().len(), 4);
    }

    #[test]
    fn test_gives_up_after_retries() {
        let mock = Arc::new(MockTransport::new(simple_camera(0x0100)));
        mock.fail_next_transfers(10, UsbStatus::Timeout);

        let control = channel(&mock, 5);
        let err = control.set(0x0100, 1, &[0u8; 26]).unwrap_err();
        assert!(matches!(err, CameraError::Transfer(UsbStatus::Timeout)));
        assert_eq!(mock.control_log().len(), 6);
    }

    #[test]
    fn test_no_device_is_not_retried() {
        let mock = Arc::new(MockTransport::new(simple_camera(0x0100)));
        mock.fail_next_transfers(10, UsbStatus::NoDevice);

        let control = channel(&mock, 5);
        let err = control.clear_halt(0x81).unwrap_err();
        assert!(matches!(err, CameraError::DeviceDisconnected));
        assert_eq!(mock.control_log().len(), 1);
    }

    #[test]
    fn test_clear_halt_setup() {
        let mock = Arc::new(MockTransport::new(simple_camera(0x0100)));
        channel(&mock, 0).clear_halt(0x81).unwrap();

        let log = mock.control_log();
        assert_eq!(
            log[0].setup,
            ControlSetup {
                request_type: 0x02,
                request: 0x01,
                value: 0,
                index: 0x81,
            }
        );
        assert_eq!(mock.clear_halt_count(0x81), 1);
    }

    #[test]
    fn test_short_read_is_insufficient_data() {
        let mock = Arc::new(MockTransport::new(simple_camera(0x0100)));
        mock.set_unit_control(2, 0x02, vec![0x10]);

        let control = channel(&mock, 0);
        let err = control
            .get(RequestCode::GetCur, 0x0200, 0x0200, 2)
            .unwrap_err();
        assert!(matches!(
            err,
            CameraError::InsufficientData {
                expected: 2,
                actual: 1
            }
        ));
    }
}
