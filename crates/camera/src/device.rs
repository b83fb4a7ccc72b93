//! UVC device facade
//!
//! [`UvcDevice`] is what applications drive. Every public operation is
//! turned into an action on the device's [`Dispatcher`], so the power
//! state, the negotiated streams and their streamers are only ever touched
//! by the dispatcher thread, in the order the calls were made.
//!
//! Frame callbacks and error handlers run on engine threads that the
//! device joins while stopping a stream. They must not call back into the
//! device.

use crate::config::{EngineConfig, StreamingSettings};
use crate::control::ControlChannel;
use crate::error::{CameraError, Result};
use crate::negotiator::{Negotiated, StreamNegotiator};
use crate::streamer::{ErrorHandler, FrameCallback, StreamStats, UvcStreamer};
use crate::transport::{CompletionHandler, RequestAction, RequestHandle, Transport, UsbStatus};
use common::Dispatcher;
use protocol::{
    DeviceDescriptors, RequestCode, StreamProfile, derive_profiles, find_profile,
    parse_descriptors,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Receive size for status interrupt packets
const INTERRUPT_BUFFER_LEN: usize = 64;

/// Device power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Fully on, control interface claimed
    D0,
    /// Off; nothing claimed, nothing streaming
    D3,
}

/// GET_MIN/MAX/RES/DEF of a unit control, raw little-endian bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRange {
    pub min: Vec<u8>,
    pub max: Vec<u8>,
    pub step: Vec<u8>,
    pub default: Vec<u8>,
}

/// Logs status interrupts from the VideoControl interface
struct InterruptListener {
    endpoint: u8,
}

impl CompletionHandler for InterruptListener {
    fn on_complete(&self, result: std::result::Result<&[u8], UsbStatus>) -> RequestAction {
        match result {
            Ok(data) => {
                debug!("Status interrupt on {:#04x}: {:02x?}", self.endpoint, data);
                RequestAction::Resubmit
            }
            Err(UsbStatus::Cancelled) | Err(UsbStatus::NoDevice) => RequestAction::Release,
            Err(status) => {
                debug!("Status interrupt on {:#04x} failed: {}", self.endpoint, status);
                RequestAction::Resubmit
            }
        }
    }
}

/// One configured stream: negotiated, and streaming once `streamer` is set
struct StreamSlot {
    profile: StreamProfile,
    negotiator: StreamNegotiator,
    negotiated: Negotiated,
    callback: FrameCallback,
    streamer: Option<UvcStreamer>,
}

impl StreamSlot {
    fn interface_number(&self) -> u8 {
        self.negotiated.profile_match.interface_number
    }
}

/// Dispatcher-owned device state
struct DeviceState {
    power: PowerState,
    descriptors: Option<DeviceDescriptors>,
    streams: Vec<StreamSlot>,
    interrupt_request: Option<RequestHandle>,
    /// Streaming interfaces claimed by configured streams
    open_interfaces: HashSet<u8>,
}

impl DeviceState {
    fn require_powered(&self) -> Result<&DeviceDescriptors> {
        if self.power != PowerState::D0 {
            return Err(CameraError::NotPowered);
        }
        self.descriptors.as_ref().ok_or(CameraError::NotPowered)
    }

    fn is_streaming(&self) -> bool {
        self.streams.iter().any(|s| s.streamer.is_some())
    }
}

struct DeviceInner {
    transport: Arc<dyn Transport>,
    control: ControlChannel,
    control_interface: u8,
    streaming: StreamingSettings,
    dispatcher: Weak<Dispatcher>,
    state: Mutex<DeviceState>,
    /// Mirror of `DeviceState::power` readable without the dispatcher
    powered: AtomicBool,
}

impl DeviceInner {
    fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn power_state(&self) -> PowerState {
        if self.powered.load(Ordering::Acquire) {
            PowerState::D0
        } else {
            PowerState::D3
        }
    }

    fn unit_index(&self, unit: u8) -> u16 {
        (unit as u16) << 8 | self.control_interface as u16
    }

    fn power_error(state: PowerState, status: UsbStatus) -> CameraError {
        match status {
            UsbStatus::NoDevice => CameraError::DeviceDisconnected,
            other => CameraError::PowerState {
                state,
                reason: other.to_string(),
            },
        }
    }

    fn apply_power_state(&self, state: &mut DeviceState, target: PowerState) -> Result<()> {
        if state.power == target {
            return Ok(());
        }

        match target {
            PowerState::D0 => self.power_up(state)?,
            PowerState::D3 => self.power_down(state),
        }

        state.power = target;
        self.powered
            .store(target == PowerState::D0, Ordering::Release);
        info!("Device entered power state {:?}", target);
        Ok(())
    }

    fn power_up(&self, state: &mut DeviceState) -> Result<()> {
        self.transport
            .open_interface(self.control_interface)
            .map_err(|e| Self::power_error(PowerState::D0, e))?;

        if state.descriptors.is_none() {
            match self.transport.enumerate_descriptors() {
                Ok(blocks) => {
                    let descriptors = parse_descriptors(&blocks, self.control_interface);
                    debug!(
                        "Parsed {} descriptor blocks: bcdUVC {:#06x}, {} streaming interface(s)",
                        blocks.len(),
                        descriptors.control.bcd_uvc,
                        descriptors.streaming.len()
                    );
                    state.descriptors = Some(descriptors);
                }
                Err(e) => {
                    if let Err(close_err) = self.transport.close_interface(self.control_interface) {
                        debug!("Failed to release control interface: {}", close_err);
                    }
                    return Err(Self::power_error(PowerState::D0, e));
                }
            }
        }

        let interrupt_endpoint = state
            .descriptors
            .as_ref()
            .and_then(|d| d.control.interrupt_endpoint);
        if let Some(endpoint) = interrupt_endpoint {
            let listener = Arc::new(InterruptListener { endpoint });
            match self
                .transport
                .submit_request(endpoint, INTERRUPT_BUFFER_LEN, listener)
            {
                Ok(handle) => state.interrupt_request = Some(handle),
                Err(e) => warn!(
                    "Failed to listen for status interrupts on {:#04x}: {}",
                    endpoint, e
                ),
            }
        }
        Ok(())
    }

    fn power_down(&self, state: &mut DeviceState) {
        for mut slot in state.streams.drain(..) {
            if let Some(mut streamer) = slot.streamer.take() {
                streamer.stop();
            }
            slot.negotiator.reset();
        }
        for interface in state.open_interfaces.drain() {
            if let Err(e) = self.transport.close_interface(interface) {
                debug!("Failed to release streaming interface {}: {}", interface, e);
            }
        }

        if let Some(handle) = state.interrupt_request.take() {
            self.transport.cancel_request(handle);
        }
        if let Err(e) = self.transport.close_interface(self.control_interface) {
            warn!("Failed to release control interface: {}", e);
        }
    }

    /// Release a streaming interface once no configured stream uses it
    fn release_unused(&self, state: &mut DeviceState, interface: u8) {
        if state.streams.iter().any(|s| s.interface_number() == interface) {
            return;
        }
        if state.open_interfaces.remove(&interface) {
            if let Err(e) = self.transport.close_interface(interface) {
                debug!("Failed to release streaming interface {}: {}", interface, e);
            }
        }
    }

    fn probe_and_commit(
        &self,
        state: &mut DeviceState,
        profile: StreamProfile,
        callback: FrameCallback,
    ) -> Result<()> {
        if state.is_streaming() {
            return Err(CameraError::AlreadyStreaming(profile));
        }
        let descriptors = state.require_powered()?;
        let Some(target) = find_profile(descriptors, &profile) else {
            return Err(CameraError::FormatNotSupported(profile));
        };
        let mut negotiator = StreamNegotiator::new(&descriptors.control);

        let interface = target.interface_number;
        if !state.open_interfaces.contains(&interface) {
            self.transport.open_interface(interface)?;
            state.open_interfaces.insert(interface);
        }

        let descriptors = state.require_powered()?;
        let negotiated = match negotiator.probe_and_commit(&self.control, descriptors, &profile) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.release_unused(state, interface);
                return Err(e);
            }
        };

        // A later commit on the same interface replaces the earlier one
        state.streams.retain(|s| {
            let keep = s.interface_number() != interface;
            if !keep {
                debug!("{} superseded by {}", s.profile, profile);
            }
            keep
        });
        state.streams.push(StreamSlot {
            profile,
            negotiator,
            negotiated,
            callback,
            streamer: None,
        });
        Ok(())
    }

    fn stream_on(&self, state: &mut DeviceState, error_handler: ErrorHandler) -> Result<()> {
        state.require_powered()?;
        if state.streams.is_empty() {
            return Err(CameraError::NotConfigured);
        }
        if let Some(slot) = state.streams.iter().find(|s| s.streamer.is_some()) {
            return Err(CameraError::AlreadyStreaming(slot.profile));
        }

        for slot in state.streams.iter_mut() {
            slot.streamer = Some(UvcStreamer::new(
                &slot.negotiated,
                Arc::clone(&slot.callback),
                &self.streaming,
                self.control.clone(),
                self.dispatcher.clone(),
            ));
        }

        let mut failure = None;
        for slot in state.streams.iter_mut() {
            let Some(streamer) = slot.streamer.as_mut() else {
                continue;
            };
            let negotiator = &mut slot.negotiator;
            if let Err(e) = streamer
                .start(Some(Arc::clone(&error_handler)))
                .and_then(|()| negotiator.mark_streaming())
            {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            warn!("Failed to start streaming, closing all streams: {}", e);
            let interfaces: Vec<u8> = state.open_interfaces.iter().copied().collect();
            for mut slot in state.streams.drain(..) {
                if let Some(mut streamer) = slot.streamer.take() {
                    streamer.stop();
                }
                slot.negotiator.reset();
            }
            for interface in interfaces {
                self.release_unused(state, interface);
            }
            return Err(e);
        }
        Ok(())
    }

    fn close(&self, state: &mut DeviceState, profile: StreamProfile) -> Result<()> {
        let Some(pos) = state.streams.iter().position(|s| s.profile == profile) else {
            return Err(CameraError::NotStreaming(profile));
        };

        let mut slot = state.streams.remove(pos);
        if let Some(mut streamer) = slot.streamer.take() {
            streamer.stop();
        }
        slot.negotiator.reset();
        self.release_unused(state, slot.interface_number());
        info!("Closed {}", profile);
        Ok(())
    }
}

/// Application-facing handle to one UVC camera
pub struct UvcDevice {
    inner: Arc<DeviceInner>,
    dispatcher: Arc<Dispatcher>,
}

impl UvcDevice {
    /// Wrap a transport; the device starts in D3
    pub fn new(transport: Arc<dyn Transport>, control_interface: u8, config: &EngineConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new("uvc", config.dispatcher.queue_capacity));
        let control = ControlChannel::new(
            Arc::clone(&transport),
            config.control.retries,
            config.control.timeout(),
        );

        let inner = Arc::new(DeviceInner {
            transport,
            control,
            control_interface,
            streaming: config.streaming.clone(),
            dispatcher: Arc::downgrade(&dispatcher),
            state: Mutex::new(DeviceState {
                power: PowerState::D3,
                descriptors: None,
                streams: Vec::new(),
                interrupt_request: None,
                open_interfaces: HashSet::new(),
            }),
            powered: AtomicBool::new(false),
        });

        Self { inner, dispatcher }
    }

    /// Run `action` on the dispatcher thread and wait for its result
    fn run<R, F>(&self, action: F) -> Result<R>
    where
        F: FnOnce(&DeviceInner, &mut DeviceState) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.dispatcher
            .invoke_and_wait(
                move |_| {
                    let mut state = inner.lock_state();
                    action(&*inner, &mut state)
                },
                || false,
            )
            .unwrap_or(Err(CameraError::DispatcherUnavailable))
    }

    fn check_connection(&self) -> Result<()> {
        if self.inner.transport.is_connected() {
            Ok(())
        } else {
            Err(CameraError::DeviceDisconnected)
        }
    }

    /// Move to `target`, returning early if another caller gets there first
    pub fn set_power_state(&self, target: PowerState) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let mirror = Arc::clone(&self.inner);
        let result = self.dispatcher.invoke_and_wait(
            move |_| {
                let mut state = inner.lock_state();
                inner.apply_power_state(&mut state, target)
            },
            move || mirror.power_state() == target,
        );

        match result {
            Some(result) => result,
            None if self.power_state() == target => Ok(()),
            None => Err(CameraError::DispatcherUnavailable),
        }
    }

    pub fn power_state(&self) -> PowerState {
        self.inner.power_state()
    }

    /// Every (format, size, fps) combination the device advertises
    pub fn get_profiles(&self) -> Result<Vec<StreamProfile>> {
        self.check_connection()?;
        self.run(|_, state| Ok(derive_profiles(state.require_powered()?)))
    }

    /// Parsed descriptor tables (requires D0)
    pub fn descriptors(&self) -> Result<DeviceDescriptors> {
        self.run(|_, state| state.require_powered().cloned())
    }

    /// Negotiate `profile` and register `callback` for its frames
    ///
    /// Streaming starts with [`stream_on`](Self::stream_on). Committing a
    /// profile on an interface that already has one replaces it.
    pub fn probe_and_commit<F>(&self, profile: StreamProfile, callback: F) -> Result<()>
    where
        F: Fn(crate::frame::Frame) + Send + Sync + 'static,
    {
        let callback: FrameCallback = Arc::new(callback);
        self.run(move |inner, state| inner.probe_and_commit(state, profile, callback))
    }

    /// Start every committed stream
    ///
    /// If any stream fails to start, all configured streams are closed and
    /// must be negotiated again.
    pub fn stream_on<E>(&self, error_handler: E) -> Result<()>
    where
        E: Fn(CameraError) + Send + Sync + 'static,
    {
        self.check_connection()?;
        let error_handler: ErrorHandler = Arc::new(error_handler);
        self.run(move |inner, state| inner.stream_on(state, error_handler))
    }

    /// Resume frame delivery on every stream
    pub fn start_callbacks(&self) -> Result<()> {
        self.run(|_, state| {
            for streamer in state.streams.iter().filter_map(|s| s.streamer.as_ref()) {
                streamer.enable_callbacks();
            }
            Ok(())
        })
    }

    /// Pause frame delivery without stopping the streams
    pub fn stop_callbacks(&self) -> Result<()> {
        self.run(|_, state| {
            for streamer in state.streams.iter().filter_map(|s| s.streamer.as_ref()) {
                streamer.disable_callbacks();
            }
            Ok(())
        })
    }

    /// Stop and forget the stream configured for `profile`
    pub fn close(&self, profile: StreamProfile) -> Result<()> {
        self.check_connection()?;
        self.run(move |inner, state| inner.close(state, profile))
    }

    /// Counters of the running stream for `profile`
    pub fn stats(&self, profile: StreamProfile) -> Result<StreamStats> {
        self.run(move |_, state| {
            state
                .streams
                .iter()
                .find(|s| s.profile == profile)
                .and_then(|s| s.streamer.as_ref())
                .map(UvcStreamer::stats)
                .ok_or(CameraError::NotStreaming(profile))
        })
    }

    /// Profiles currently committed, streaming or not
    pub fn configured_profiles(&self) -> Result<Vec<StreamProfile>> {
        self.run(|_, state| Ok(state.streams.iter().map(|s| s.profile).collect()))
    }

    /// GET_CUR of a unit or terminal control
    pub fn get_unit_control(&self, unit: u8, selector: u8, len: usize) -> Result<Vec<u8>> {
        self.run(move |inner, state| {
            state.require_powered()?;
            inner.control.get(
                RequestCode::GetCur,
                (selector as u16) << 8,
                inner.unit_index(unit),
                len,
            )
        })
    }

    /// SET_CUR of a unit or terminal control
    pub fn set_unit_control(&self, unit: u8, selector: u8, data: Vec<u8>) -> Result<()> {
        self.run(move |inner, state| {
            state.require_powered()?;
            inner
                .control
                .set((selector as u16) << 8, inner.unit_index(unit), &data)
        })
    }

    /// GET_MIN, GET_MAX, GET_RES and GET_DEF of a unit or terminal control
    pub fn get_unit_control_range(&self, unit: u8, selector: u8, len: usize) -> Result<ControlRange> {
        self.run(move |inner, state| {
            state.require_powered()?;
            let value = (selector as u16) << 8;
            let index = inner.unit_index(unit);
            Ok(ControlRange {
                min: inner.control.get(RequestCode::GetMin, value, index, len)?,
                max: inner.control.get(RequestCode::GetMax, value, index, len)?,
                step: inner.control.get(RequestCode::GetRes, value, index, len)?,
                default: inner.control.get(RequestCode::GetDef, value, index, len)?,
            })
        })
    }
}

impl Drop for UvcDevice {
    fn drop(&mut self) {
        if let Err(e) = self.set_power_state(PowerState::D3) {
            warn!("Failed to power down device on drop: {}", e);
        }
        self.dispatcher.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use protocol::FourCc;
    use protocol::test_utils::{TEST_INTERRUPT_ENDPOINT, simple_camera};

    fn device() -> (Arc<MockTransport>, UvcDevice) {
        let mock = Arc::new(MockTransport::new(simple_camera(0x0100)));
        let device = UvcDevice::new(mock.clone(), 0, &EngineConfig::default());
        (mock, device)
    }

    #[test]
    fn test_starts_in_d3() {
        let (_mock, device) = device();
        assert_eq!(device.power_state(), PowerState::D3);
        assert!(matches!(device.get_profiles(), Err(CameraError::NotPowered)));
    }

    #[test]
    fn test_power_cycle() {
        let (mock, device) = device();
        device.set_power_state(PowerState::D0).unwrap();
        assert_eq!(device.power_state(), PowerState::D0);
        assert_eq!(mock.open_interfaces(), vec![0]);
        assert_eq!(mock.outstanding(TEST_INTERRUPT_ENDPOINT), 1);

        // Repeating is a no-op
        device.set_power_state(PowerState::D0).unwrap();
        assert_eq!(mock.outstanding(TEST_INTERRUPT_ENDPOINT), 1);

        assert!(mock.deliver(TEST_INTERRUPT_ENDPOINT, &[0x01, 0x02, 0x00]));
        assert_eq!(mock.outstanding(TEST_INTERRUPT_ENDPOINT), 1);

        device.set_power_state(PowerState::D3).unwrap();
        assert!(mock.open_interfaces().is_empty());
        assert_eq!(mock.outstanding(TEST_INTERRUPT_ENDPOINT), 0);
    }

    #[test]
    fn test_power_up_fails_when_disconnected() {
        let (mock, device) = device();
        mock.disconnect();
        assert!(matches!(
            device.set_power_state(PowerState::D0),
            Err(CameraError::DeviceDisconnected)
        ));
        assert_eq!(device.power_state(), PowerState::D3);
    }

    #[test]
    fn test_unit_controls() {
        let (mock, device) = device();
        device.set_power_state(PowerState::D0).unwrap();

        mock.set_unit_control(2, 0x02, vec![0x40, 0x00]);
        assert_eq!(device.get_unit_control(2, 0x02, 2).unwrap(), vec![0x40, 0x00]);

        device.set_unit_control(2, 0x02, vec![0x20, 0x00]).unwrap();
        assert_eq!(mock.unit_control(2, 0x02), Some(vec![0x20, 0x00]));

        let last = mock.control_log().pop().unwrap();
        assert_eq!(last.setup.request_type, 0x21);
        assert_eq!(last.setup.value, 0x0200);
        assert_eq!(last.setup.index, 0x0200);

        mock.set_unit_range(2, 0x02, vec![0, 0], vec![0xff, 0], vec![1, 0], vec![0x80, 0]);
        let range = device.get_unit_control_range(2, 0x02, 2).unwrap();
        assert_eq!(range.max, vec![0xff, 0]);
        assert_eq!(range.default, vec![0x80, 0]);
    }

    #[test]
    fn test_probe_requires_power() {
        let (mock, device) = device();
        let profile = StreamProfile::new(FourCc::YUY2, 640, 480, 30);
        assert!(matches!(
            device.probe_and_commit(profile, |_| {}),
            Err(CameraError::NotPowered)
        ));
        assert!(mock.control_log().is_empty());
    }
}
