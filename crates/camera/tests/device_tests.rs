//! End-to-end tests of the device facade over the in-memory transport
//!
//! Run with: `cargo test -p camera --test device_tests`

use camera::test_utils::{MockTransport, payload};
use camera::{CameraError, EngineConfig, Frame, NegotiationState, PowerState, UsbStatus, UvcDevice};
use common::test_utils::{DEFAULT_TEST_TIMEOUT, wait_until};
use protocol::test_utils::{
    TEST_FRAME_BUFFER_SIZE, TEST_INTERRUPT_ENDPOINT, TEST_STREAM_ENDPOINT, simple_camera,
};
use protocol::{ControlBlockLength, FourCc, StreamControlBlock, StreamProfile};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// ============================================================================
// Test Utilities
// ============================================================================

const PROBE: u16 = 0x0100;
const COMMIT: u16 = 0x0200;
const SET_CUR: u8 = 0x01;
const GET_CUR: u8 = 0x81;

fn yuy2(fps: u32) -> StreamProfile {
    StreamProfile::new(FourCc::YUY2, 640, 480, fps)
}

/// What the callback saw; frames themselves go straight back to the pool
#[derive(Debug)]
struct Received {
    profile: StreamProfile,
    header_len: usize,
    pixels: Vec<u8>,
}

impl From<Frame> for Received {
    fn from(frame: Frame) -> Self {
        Self {
            profile: *frame.profile(),
            header_len: frame.header_len(),
            pixels: frame.pixels().to_vec(),
        }
    }
}

struct Fixture {
    mock: Arc<MockTransport>,
    device: UvcDevice,
    frames: Arc<Mutex<Vec<Received>>>,
    errors: Arc<Mutex<Vec<CameraError>>>,
}

impl Fixture {
    fn new(bcd_uvc: u16) -> Self {
        Self::with_config(bcd_uvc, EngineConfig::default())
    }

    fn with_config(bcd_uvc: u16, config: EngineConfig) -> Self {
        common::init_test_logging();
        let mock = Arc::new(MockTransport::new(simple_camera(bcd_uvc)));
        let device = UvcDevice::new(mock.clone(), 0, &config);
        device.set_power_state(PowerState::D0).unwrap();
        Self {
            mock,
            device,
            frames: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn commit(&self, profile: StreamProfile) -> Result<(), CameraError> {
        let sink = Arc::clone(&self.frames);
        self.device
            .probe_and_commit(profile, move |frame| sink.lock().unwrap().push(frame.into()))
    }

    fn stream_on(&self) -> Result<(), CameraError> {
        let sink = Arc::clone(&self.errors);
        self.device
            .stream_on(move |e| sink.lock().unwrap().push(e))
    }

    fn start(&self, profile: StreamProfile) {
        self.commit(profile).unwrap();
        self.stream_on().unwrap();
    }

    fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

// ============================================================================
// Power and descriptors
// ============================================================================

#[test]
fn test_profiles_from_descriptors() {
    let f = Fixture::new(0x0110);
    let profiles = f.device.get_profiles().unwrap();
    assert_eq!(profiles, vec![yuy2(30), yuy2(15)]);

    let descriptors = f.device.descriptors().unwrap();
    assert_eq!(descriptors.control.bcd_uvc, 0x0110);
    assert_eq!(descriptors.streaming.len(), 1);
}

#[test]
fn test_profiles_require_connection() {
    let f = Fixture::new(0x0110);
    f.mock.disconnect();
    assert!(matches!(
        f.device.get_profiles(),
        Err(CameraError::DeviceDisconnected)
    ));
}

#[test]
fn test_power_down_releases_everything() {
    let f = Fixture::new(0x0110);
    f.start(yuy2(30));
    assert_eq!(f.mock.open_interfaces(), vec![0, 1]);
    assert_eq!(f.mock.outstanding(TEST_INTERRUPT_ENDPOINT), 1);

    f.device.set_power_state(PowerState::D3).unwrap();
    assert_eq!(f.device.power_state(), PowerState::D3);
    assert!(f.mock.open_interfaces().is_empty());
    assert_eq!(f.mock.outstanding(TEST_INTERRUPT_ENDPOINT), 0);
    assert_eq!(f.mock.outstanding(TEST_STREAM_ENDPOINT), 0);
    assert!(f.device.configured_profiles().unwrap().is_empty());
}

#[test]
fn test_power_state_from_many_threads() {
    let f = Fixture::new(0x0110);
    let device = Arc::new(f.device);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                let target = if i % 2 == 0 { PowerState::D3 } else { PowerState::D0 };
                device.set_power_state(target).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    // Callers may return before their transition runs; wait for the queue to drain
    device.configured_profiles().unwrap();

    device.set_power_state(PowerState::D0).unwrap();
    assert_eq!(device.power_state(), PowerState::D0);
    assert_eq!(f.mock.outstanding(TEST_INTERRUPT_ENDPOINT), 1);
}

// ============================================================================
// Negotiation
// ============================================================================

#[test]
fn test_unsupported_profile_touches_nothing() {
    let f = Fixture::new(0x0110);
    f.mock.clear_log();

    let result = f.commit(StreamProfile::new(FourCc::MJPG, 1920, 1080, 60));
    assert!(matches!(result, Err(CameraError::FormatNotSupported(_))));
    assert!(f.mock.control_log().is_empty());
    assert_eq!(f.mock.open_interfaces(), vec![0]);
}

#[test]
fn test_commit_sends_what_the_device_reported() {
    let f = Fixture::new(0x0110);
    f.mock.clamp_frame_interval(400_000);
    f.mock.clear_log();

    f.commit(yuy2(30)).unwrap();

    let log = f.mock.control_log();
    let requests: Vec<(u8, u16)> = log.iter().map(|r| (r.setup.request, r.setup.value)).collect();
    assert_eq!(
        requests,
        vec![(0x83, PROBE), (SET_CUR, PROBE), (GET_CUR, PROBE), (SET_CUR, COMMIT)]
    );
    assert!(log.iter().all(|r| r.setup.index == 1 && r.data.len() == 34));

    let reported = &log[2].data;
    let committed = &log[3].data;
    assert_eq!(reported, committed);

    let block = f.mock.committed_block().unwrap();
    assert_eq!(block.frame_interval, 400_000);
    assert_eq!(block.max_video_frame_size, TEST_FRAME_BUFFER_SIZE);
    assert_eq!(block.format_index, 1);
    assert_eq!(block.frame_index, 1);
}

#[test]
fn test_probe_set_clears_size_fields() {
    let f = Fixture::new(0x0110);
    f.mock.clear_log();
    f.commit(yuy2(15)).unwrap();

    let probe_set = &f.mock.control_log()[1];
    let block = StreamControlBlock::decode(&probe_set.data, ControlBlockLength::Uvc11, 0).unwrap();
    assert_eq!(block.max_video_frame_size, 0);
    assert_eq!(block.max_payload_transfer_size, 0);
    assert_eq!(block.frame_interval, 666_666);
    assert_eq!(block.hint, 1);
}

#[test]
fn test_uvc10_blocks_are_26_bytes() {
    let f = Fixture::new(0x0100);
    f.mock.clear_log();
    f.commit(yuy2(30)).unwrap();

    let log = f.mock.control_log();
    assert_eq!(log.len(), 4);
    assert!(log.iter().all(|r| r.data.len() == 26));
}

#[test]
fn test_uvc15_blocks_are_48_bytes() {
    let f = Fixture::new(0x0150);
    f.mock.clear_log();
    f.commit(yuy2(30)).unwrap();
    assert!(f.mock.control_log().iter().all(|r| r.data.len() == 48));
}

#[test]
fn test_commit_failure_is_reported() {
    let f = Fixture::new(0x0110);
    f.mock.fail_matching(SET_CUR, COMMIT, UsbStatus::Pipe);

    assert!(matches!(
        f.commit(yuy2(30)),
        Err(CameraError::Transfer(UsbStatus::Pipe))
    ));
    assert!(f.device.configured_profiles().unwrap().is_empty());
    assert_eq!(f.mock.open_interfaces(), vec![0]);
    assert!(matches!(f.stream_on(), Err(CameraError::NotConfigured)));
}

#[test]
fn test_negotiation_state_transitions() {
    let f = Fixture::new(0x0110);
    let descriptors = f.device.descriptors().unwrap();
    let control = camera::control::ControlChannel::new(f.mock.clone(), 5, Duration::from_millis(10));

    let mut negotiator = camera::StreamNegotiator::new(&descriptors.control);
    assert_eq!(negotiator.state(), NegotiationState::Idle);
    negotiator
        .probe_and_commit(&control, &descriptors, &yuy2(30))
        .unwrap();
    assert_eq!(negotiator.state(), NegotiationState::Committed);
    negotiator.mark_streaming().unwrap();
    assert_eq!(negotiator.state(), NegotiationState::Streaming);
    negotiator.reset();
    assert_eq!(negotiator.state(), NegotiationState::Idle);
}

// ============================================================================
// Streaming
// ============================================================================

#[test]
fn test_stream_on_without_commit() {
    let f = Fixture::new(0x0110);
    assert!(matches!(f.stream_on(), Err(CameraError::NotConfigured)));
}

#[test]
fn test_stream_on_twice() {
    let f = Fixture::new(0x0110);
    f.start(yuy2(30));
    assert!(matches!(f.stream_on(), Err(CameraError::AlreadyStreaming(_))));
    assert!(matches!(f.commit(yuy2(15)), Err(CameraError::AlreadyStreaming(_))));
}

#[test]
fn test_requests_stay_outstanding() {
    let f = Fixture::new(0x0110);
    f.mock.set_device_frame_size(2);
    f.start(yuy2(30));
    let count = EngineConfig::default().streaming.request_count;
    assert_eq!(f.mock.outstanding(TEST_STREAM_ENDPOINT), count);

    for i in 0..10u8 {
        assert!(f.mock.deliver(TEST_STREAM_ENDPOINT, &payload(12, 0, &[i, i])));
        assert_eq!(f.mock.outstanding(TEST_STREAM_ENDPOINT), count);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || f.frame_count() == i as usize + 1));
    }
    let stats = f.device.stats(yuy2(30)).unwrap();
    assert_eq!(stats.published, 10);
    assert_eq!(stats.dropped_no_buffer, 0);
}

#[test]
fn test_payload_becomes_frame() {
    let f = Fixture::new(0x0110);
    f.mock.set_device_frame_size(2);
    f.start(yuy2(30));

    let data = payload(12, 0x02, &[0xaa, 0xbb]);
    assert_eq!(data.len(), 14);
    assert!(f.mock.deliver(TEST_STREAM_ENDPOINT, &data));

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || f.frame_count() == 1));
    let frames = f.frames.lock().unwrap();
    assert_eq!(frames[0].header_len, 12);
    assert_eq!(frames[0].pixels, vec![0xaa, 0xbb]);
    assert_eq!(frames[0].profile, yuy2(30));
}

#[test]
fn test_error_payload_is_dropped() {
    let f = Fixture::new(0x0110);
    f.mock.set_device_frame_size(2);
    f.start(yuy2(30));

    assert!(f.mock.deliver(TEST_STREAM_ENDPOINT, &payload(12, 0x40, &[1, 2])));
    assert!(f.mock.deliver(TEST_STREAM_ENDPOINT, &payload(12, 0, &[1, 2, 3])));
    assert!(f.mock.deliver(TEST_STREAM_ENDPOINT, &payload(12, 0, &[3, 4])));

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || f.frame_count() == 1));
    assert_eq!(f.frames.lock().unwrap()[0].pixels, vec![3, 4]);
    assert_eq!(
        f.mock.outstanding(TEST_STREAM_ENDPOINT),
        EngineConfig::default().streaming.request_count
    );

    let stats = f.device.stats(yuy2(30)).unwrap();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.dropped_invalid, 2);
}

#[test]
fn test_failed_transfer_is_resubmitted() {
    let f = Fixture::new(0x0110);
    f.start(yuy2(30));
    let count = EngineConfig::default().streaming.request_count;

    assert!(f.mock.fail_request(TEST_STREAM_ENDPOINT, UsbStatus::Overflow));
    assert_eq!(f.mock.outstanding(TEST_STREAM_ENDPOINT), count);
    assert!(f.errors.lock().unwrap().is_empty());
}

#[test]
fn test_paused_callbacks() {
    let f = Fixture::new(0x0110);
    f.mock.set_device_frame_size(2);
    f.start(yuy2(30));

    f.device.stop_callbacks().unwrap();
    assert!(f.mock.deliver(TEST_STREAM_ENDPOINT, &payload(12, 0, &[1, 1])));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        f.device.stats(yuy2(30)).unwrap().received == 1
    }));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(f.frame_count(), 0);

    f.device.start_callbacks().unwrap();
    assert!(f.mock.deliver(TEST_STREAM_ENDPOINT, &payload(12, 0, &[2, 2])));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || f.frame_count() == 1));
    assert_eq!(f.frames.lock().unwrap()[0].pixels, vec![2, 2]);
}

#[test]
fn test_watchdog_resets_stalled_endpoint() {
    let mut config = EngineConfig::default();
    config.streaming.watchdog_multiplier = 2;
    let f = Fixture::with_config(0x0110, config);
    f.start(yuy2(30));

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        f.mock.clear_halt_count(TEST_STREAM_ENDPOINT) == 1
    }));

    // One reset per stall, however long it lasts
    thread::sleep(Duration::from_millis(300));
    assert_eq!(f.mock.clear_halt_count(TEST_STREAM_ENDPOINT), 1);
    assert_eq!(f.device.stats(yuy2(30)).unwrap().watchdog_resets, 1);

    let clear = f
        .mock
        .control_log()
        .into_iter()
        .find(|r| r.setup.request_type == 0x02)
        .unwrap();
    assert_eq!(clear.setup.request, 0x01);
    assert_eq!(clear.setup.value, 0);
    assert_eq!(clear.setup.index, TEST_STREAM_ENDPOINT as u16);
}

#[test]
fn test_disconnect_while_streaming() {
    let f = Fixture::new(0x0110);
    f.start(yuy2(30));

    f.mock.disconnect();
    assert!(f.mock.fail_request(TEST_STREAM_ENDPOINT, UsbStatus::NoDevice));
    assert!(f.mock.fail_request(TEST_STREAM_ENDPOINT, UsbStatus::NoDevice));

    let errors = f.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], CameraError::DeviceDisconnected));
    drop(errors);

    assert!(matches!(f.device.close(yuy2(30)), Err(CameraError::DeviceDisconnected)));
    assert!(matches!(f.stream_on(), Err(CameraError::DeviceDisconnected)));
    assert!(matches!(
        f.device.get_unit_control(2, 0x02, 2),
        Err(CameraError::DeviceDisconnected)
    ));
}

#[test]
fn test_close_stops_one_stream() {
    let f = Fixture::new(0x0110);
    f.start(yuy2(30));

    f.device.close(yuy2(30)).unwrap();
    assert_eq!(f.mock.outstanding(TEST_STREAM_ENDPOINT), 0);
    assert_eq!(f.mock.open_interfaces(), vec![0]);
    assert!(matches!(f.device.stats(yuy2(30)), Err(CameraError::NotStreaming(_))));
    assert!(matches!(f.device.close(yuy2(30)), Err(CameraError::NotStreaming(_))));

    // The device can be configured again after a close
    f.start(yuy2(15));
    assert_eq!(f.mock.committed_block().unwrap().frame_interval, 666_666);
}

#[test]
fn test_recommit_replaces_profile_on_same_interface() {
    let f = Fixture::new(0x0110);
    f.commit(yuy2(30)).unwrap();
    f.commit(yuy2(15)).unwrap();
    assert_eq!(f.device.configured_profiles().unwrap(), vec![yuy2(15)]);
}

// ============================================================================
// Unit controls
// ============================================================================

#[test]
fn test_unit_control_round_trip() {
    let f = Fixture::new(0x0110);
    f.device.set_unit_control(2, 0x03, vec![0x10, 0x00]).unwrap();
    assert_eq!(f.device.get_unit_control(2, 0x03, 2).unwrap(), vec![0x10, 0x00]);

    let log = f.mock.control_log();
    let set = &log[log.len() - 2];
    assert_eq!(set.setup.request_type, 0x21);
    assert_eq!(set.setup.value, 0x0300);
    assert_eq!(set.setup.index, 0x0200);
}

#[test]
fn test_unit_control_stall_is_retried_then_reported() {
    let f = Fixture::new(0x0110);
    f.mock.clear_log();
    assert!(matches!(
        f.device.get_unit_control(2, 0x09, 2),
        Err(CameraError::Transfer(UsbStatus::Pipe))
    ));
    let retries = EngineConfig::default().control.retries as usize;
    assert_eq!(f.mock.control_log().len(), retries + 1);
}

#[test]
fn test_unit_controls_require_power() {
    let f = Fixture::new(0x0110);
    f.device.set_power_state(PowerState::D3).unwrap();
    assert!(matches!(
        f.device.get_unit_control(2, 0x02, 2),
        Err(CameraError::NotPowered)
    ));
}
