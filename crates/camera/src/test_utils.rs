//! In-memory transport for engine tests
//!
//! [`MockTransport`] behaves like a single UVC camera: it serves a fixed
//! descriptor set, answers Probe/Commit and unit-control requests from
//! stored state, and keeps submitted receive requests until the test
//! completes them with [`MockTransport::deliver`] or
//! [`MockTransport::fail_request`].

use crate::transport::{
    CompletionHandler, ControlSetup, RequestAction, RequestHandle, Transport, UsbStatus,
};
use protocol::constants::{REQ_CLEAR_FEATURE, REQ_TYPE_ENDPOINT_STANDARD};
use protocol::test_utils::TEST_FRAME_BUFFER_SIZE;
use protocol::{
    ControlBlockLength, DescriptorBlock, RequestCode, StreamControlBlock, VsControlSelector,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Payload size the mock reports after a probe
pub const MOCK_PAYLOAD_TRANSFER_SIZE: u32 = 3072;

/// Build a stream payload: a `header_len`-byte header with `info` flags, then `pixels`
pub fn payload(header_len: u8, info: u8, pixels: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; header_len as usize];
    if let Some(first) = data.first_mut() {
        *first = header_len;
    }
    if let Some(second) = data.get_mut(1) {
        *second = info;
    }
    data.extend_from_slice(pixels);
    data
}

/// One control transfer as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub setup: ControlSetup,
    /// Bytes sent (SET) or returned (GET)
    pub data: Vec<u8>,
}

struct PendingRequest {
    endpoint: u8,
    buffer_len: usize,
    handler: Arc<dyn CompletionHandler>,
}

struct Injected {
    fail_next: u32,
    fail_status: UsbStatus,
    fail_matching: Vec<(u8, u16, UsbStatus)>,
}

#[derive(Default)]
struct DeviceModel {
    frame_size: u32,
    clamp_interval: Option<u32>,
    probe: Option<StreamControlBlock>,
    committed: Option<StreamControlBlock>,
    /// (unit, selector, request) -> value
    unit_controls: HashMap<(u8, u8, u8), Vec<u8>>,
    clear_halts: HashMap<u8, usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable single-camera transport
pub struct MockTransport {
    descriptors: Vec<DescriptorBlock>,
    connected: AtomicBool,
    log: Mutex<Vec<ControlRecord>>,
    injected: Mutex<Injected>,
    model: Mutex<DeviceModel>,
    open: Mutex<HashSet<u8>>,
    /// Outstanding requests in completion order
    requests: Mutex<Vec<(u64, PendingRequest)>>,
    next_handle: AtomicU64,
    resubmits: AtomicU64,
    /// Held while a completion runs; cancel takes it to wait one out
    callback_lock: Mutex<()>,
}

impl MockTransport {
    pub fn new(descriptors: Vec<DescriptorBlock>) -> Self {
        Self {
            descriptors,
            connected: AtomicBool::new(true),
            log: Mutex::new(Vec::new()),
            injected: Mutex::new(Injected {
                fail_next: 0,
                fail_status: UsbStatus::Io,
                fail_matching: Vec::new(),
            }),
            model: Mutex::new(DeviceModel {
                frame_size: TEST_FRAME_BUFFER_SIZE,
                ..Default::default()
            }),
            open: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            resubmits: AtomicU64::new(0),
            callback_lock: Mutex::new(()),
        }
    }

    /// dwMaxVideoFrameSize reported after a probe
    pub fn set_device_frame_size(&self, size: u32) {
        lock(&self.model).frame_size = size;
    }

    /// Make the device replace any probed frame interval with `interval`
    pub fn clamp_frame_interval(&self, interval: u32) {
        lock(&self.model).clamp_interval = Some(interval);
    }

    /// Fail the next `count` control transfers with `status`
    pub fn fail_next_transfers(&self, count: u32, status: UsbStatus) {
        let mut injected = lock(&self.injected);
        injected.fail_next = count;
        injected.fail_status = status;
    }

    /// Fail every control transfer with this request code and wValue
    pub fn fail_matching(&self, request: u8, value: u16, status: UsbStatus) {
        lock(&self.injected).fail_matching.push((request, value, status));
    }

    /// Store the GET_CUR value of a unit control
    pub fn set_unit_control(&self, unit: u8, selector: u8, value: Vec<u8>) {
        lock(&self.model)
            .unit_controls
            .insert((unit, selector, RequestCode::GetCur as u8), value);
    }

    /// Store the GET_MIN/MAX/RES/DEF values of a unit control
    pub fn set_unit_range(&self, unit: u8, selector: u8, min: Vec<u8>, max: Vec<u8>, res: Vec<u8>, def: Vec<u8>) {
        let mut model = lock(&self.model);
        for (request, value) in [
            (RequestCode::GetMin, min),
            (RequestCode::GetMax, max),
            (RequestCode::GetRes, res),
            (RequestCode::GetDef, def),
        ] {
            model.unit_controls.insert((unit, selector, request as u8), value);
        }
    }

    pub fn unit_control(&self, unit: u8, selector: u8) -> Option<Vec<u8>> {
        lock(&self.model)
            .unit_controls
            .get(&(unit, selector, RequestCode::GetCur as u8))
            .cloned()
    }

    /// Every control transfer attempted so far, failed ones included
    pub fn control_log(&self) -> Vec<ControlRecord> {
        lock(&self.log).clone()
    }

    pub fn clear_log(&self) {
        lock(&self.log).clear();
    }

    /// Last block committed, decoded without clock frequency
    pub fn committed_block(&self) -> Option<StreamControlBlock> {
        lock(&self.model).committed.clone()
    }

    pub fn clear_halt_count(&self, endpoint: u8) -> usize {
        lock(&self.model)
            .clear_halts
            .get(&endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Interfaces currently claimed, in ascending order
    pub fn open_interfaces(&self) -> Vec<u8> {
        let mut open: Vec<u8> = lock(&self.open).iter().copied().collect();
        open.sort_unstable();
        open
    }

    /// Requests currently outstanding on `endpoint`
    pub fn outstanding(&self, endpoint: u8) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|(_, r)| r.endpoint == endpoint)
            .count()
    }

    /// Completions the handler answered with Resubmit
    pub fn resubmit_count(&self) -> u64 {
        self.resubmits.load(Ordering::Acquire)
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::Release);
    }

    /// Complete one outstanding request on `endpoint` with `data`
    ///
    /// Returns false if nothing was outstanding there.
    pub fn deliver(&self, endpoint: u8, data: &[u8]) -> bool {
        self.complete(endpoint, Ok(data))
    }

    /// Complete one outstanding request on `endpoint` with a failure
    pub fn fail_request(&self, endpoint: u8, status: UsbStatus) -> bool {
        self.complete(endpoint, Err(status))
    }

    fn complete(&self, endpoint: u8, result: Result<&[u8], UsbStatus>) -> bool {
        let _in_flight = lock(&self.callback_lock);

        let picked = {
            let requests = lock(&self.requests);
            requests
                .iter()
                .position(|(_, r)| r.endpoint == endpoint)
                .map(|pos| (requests[pos].0, requests[pos].1.buffer_len, Arc::clone(&requests[pos].1.handler)))
        };
        let Some((handle, buffer_len, handler)) = picked else {
            return false;
        };

        let result = result.map(|data| &data[..data.len().min(buffer_len)]);
        let action = handler.on_complete(result);

        let mut requests = lock(&self.requests);
        if let Some(pos) = requests.iter().position(|(h, _)| *h == handle) {
            let request = requests.remove(pos);
            // Resubmitted requests go to the back so completions rotate
            if action == RequestAction::Resubmit {
                self.resubmits.fetch_add(1, Ordering::AcqRel);
                requests.push(request);
            }
        }
        true
    }

    fn inject(&self, setup: ControlSetup) -> Result<(), UsbStatus> {
        if !self.is_connected() {
            return Err(UsbStatus::NoDevice);
        }
        let mut injected = lock(&self.injected);
        if injected.fail_next > 0 {
            injected.fail_next -= 1;
            return Err(injected.fail_status.clone());
        }
        if let Some((_, _, status)) = injected
            .fail_matching
            .iter()
            .find(|(request, value, _)| *request == setup.request && *value == setup.value)
        {
            return Err(status.clone());
        }
        Ok(())
    }

    fn execute(&self, setup: ControlSetup, data: &mut [u8]) -> Result<usize, UsbStatus> {
        if setup.request_type == REQ_TYPE_ENDPOINT_STANDARD && setup.request == REQ_CLEAR_FEATURE {
            *lock(&self.model)
                .clear_halts
                .entry(setup.index as u8)
                .or_insert(0) += 1;
            return Ok(0);
        }

        let selector = (setup.value >> 8) as u8;
        let unit = (setup.index >> 8) as u8;
        let Some(request) = RequestCode::from_u8(setup.request) else {
            return Err(UsbStatus::Pipe);
        };

        if unit == 0 {
            self.stream_request(request, selector, data)
        } else {
            self.unit_request(unit, selector, request, data)
        }
    }

    fn stream_request(&self, request: RequestCode, selector: u8, data: &mut [u8]) -> Result<usize, UsbStatus> {
        let length = ControlBlockLength::from_len(data.len()).map_err(|_| UsbStatus::Overflow)?;
        let probe = selector == VsControlSelector::Probe as u8;
        let commit = selector == VsControlSelector::Commit as u8;
        if !probe && !commit {
            return Err(UsbStatus::Pipe);
        }

        let mut model = lock(&self.model);
        match request {
            RequestCode::SetCur => {
                let mut block =
                    StreamControlBlock::decode(data, length, 0).map_err(|_| UsbStatus::Overflow)?;
                if probe {
                    block.max_video_frame_size = model.frame_size;
                    block.max_payload_transfer_size = MOCK_PAYLOAD_TRANSFER_SIZE;
                    if let Some(interval) = model.clamp_interval {
                        block.frame_interval = interval;
                    }
                    model.probe = Some(block);
                } else {
                    model.committed = Some(block);
                }
            }
            RequestCode::GetCur => {
                let block = if probe {
                    model.probe.clone()
                } else {
                    model.committed.clone()
                }
                .unwrap_or_default();
                data.copy_from_slice(&block.encode(length));
            }
            RequestCode::GetMin | RequestCode::GetMax | RequestCode::GetDef if probe => {
                let block = StreamControlBlock {
                    format_index: 1,
                    frame_index: 1,
                    frame_interval: 333_333,
                    max_video_frame_size: model.frame_size,
                    max_payload_transfer_size: MOCK_PAYLOAD_TRANSFER_SIZE,
                    ..Default::default()
                };
                data.copy_from_slice(&block.encode(length));
            }
            _ => return Err(UsbStatus::Pipe),
        }
        Ok(data.len())
    }

    fn unit_request(&self, unit: u8, selector: u8, request: RequestCode, data: &mut [u8]) -> Result<usize, UsbStatus> {
        let mut model = lock(&self.model);
        if request == RequestCode::SetCur {
            model
                .unit_controls
                .insert((unit, selector, RequestCode::GetCur as u8), data.to_vec());
            return Ok(data.len());
        }

        let value = model
            .unit_controls
            .get(&(unit, selector, request as u8))
            .ok_or(UsbStatus::Pipe)?;
        let len = value.len().min(data.len());
        data[..len].copy_from_slice(&value[..len]);
        Ok(len)
    }
}

impl Transport for MockTransport {
    fn enumerate_descriptors(&self) -> Result<Vec<DescriptorBlock>, UsbStatus> {
        if !self.is_connected() {
            return Err(UsbStatus::NoDevice);
        }
        Ok(self.descriptors.clone())
    }

    fn control_transfer(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbStatus> {
        let result = self.inject(setup).and_then(|()| self.execute(setup, data));
        lock(&self.log).push(ControlRecord {
            setup,
            data: data.to_vec(),
        });
        result
    }

    fn open_interface(&self, interface: u8) -> Result<(), UsbStatus> {
        if !self.is_connected() {
            return Err(UsbStatus::NoDevice);
        }
        lock(&self.open).insert(interface);
        Ok(())
    }

    fn close_interface(&self, interface: u8) -> Result<(), UsbStatus> {
        if !self.is_connected() {
            return Err(UsbStatus::NoDevice);
        }
        lock(&self.open).remove(&interface);
        Ok(())
    }

    fn submit_request(
        &self,
        endpoint: u8,
        buffer_len: usize,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<RequestHandle, UsbStatus> {
        if !self.is_connected() {
            return Err(UsbStatus::NoDevice);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        lock(&self.requests).push((
            handle,
            PendingRequest {
                endpoint,
                buffer_len,
                handler,
            },
        ));
        Ok(RequestHandle(handle))
    }

    fn cancel_request(&self, handle: RequestHandle) {
        let _in_flight = lock(&self.callback_lock);
        lock(&self.requests).retain(|(h, _)| *h != handle.0);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
