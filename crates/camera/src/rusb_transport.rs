//! libusb-backed transport
//!
//! Receive requests are served by one reader thread each, looping over
//! blocking bulk or interrupt reads with a short timeout so cancellation is
//! noticed promptly. Isochronous endpoints are not supported.

use crate::transport::{
    CompletionHandler, ControlSetup, RequestAction, RequestHandle, Transport, UsbStatus,
};
use protocol::{DescriptorBlock, split_descriptors};
use rusb::{Context, Device, DeviceHandle, TransferType, UsbContext};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// USB interface class of video devices
pub const VIDEO_CLASS: u8 = 0x0e;
const VIDEO_CONTROL_SUBCLASS: u8 = 0x01;

/// How long a reader thread blocks before checking for cancellation
const READ_POLL: Duration = Duration::from_millis(100);
/// Pause after a failed read, doubled per consecutive failure up to READ_POLL
const ERROR_BACKOFF_MIN: Duration = Duration::from_millis(10);
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

const GET_DESCRIPTOR: u8 = 0x06;
const CONFIG_DESCRIPTOR_TYPE: u16 = 0x02;
const CONFIG_HEADER_LEN: usize = 9;

/// A video device found on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    pub control_interface: u8,
    pub product: Option<String>,
}

/// Map rusb errors to transport status codes
pub fn map_rusb_error(err: rusb::Error) -> UsbStatus {
    match err {
        rusb::Error::Timeout => UsbStatus::Timeout,
        rusb::Error::Pipe => UsbStatus::Pipe,
        rusb::Error::NoDevice => UsbStatus::NoDevice,
        rusb::Error::NotFound => UsbStatus::NotFound,
        rusb::Error::Busy => UsbStatus::Busy,
        rusb::Error::Overflow => UsbStatus::Overflow,
        rusb::Error::Io => UsbStatus::Io,
        rusb::Error::InvalidParam => UsbStatus::InvalidParam,
        rusb::Error::Access => UsbStatus::Access,
        rusb::Error::Interrupted => UsbStatus::Cancelled,
        _ => UsbStatus::Other(err.to_string()),
    }
}

/// Delay between reads of an endpoint that keeps failing
struct ErrorBackoff {
    next: Duration,
}

impl ErrorBackoff {
    fn new() -> Self {
        Self { next: ERROR_BACKOFF_MIN }
    }

    fn reset(&mut self) {
        self.next = ERROR_BACKOFF_MIN;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(READ_POLL);
        delay
    }
}

/// Read loop behind one submitted request
///
/// Runs until the handler releases the request or `stop` is set. A failed
/// read that the handler resubmits is retried after a capped backoff, so a
/// halted endpoint cannot spin the thread.
fn run_reader<F>(
    endpoint: u8,
    buffer_len: usize,
    stop: &AtomicBool,
    handler: &dyn CompletionHandler,
    disconnected: &AtomicBool,
    mut read: F,
) where
    F: FnMut(&mut [u8]) -> rusb::Result<usize>,
{
    let mut buf = vec![0u8; buffer_len];
    let mut backoff = ErrorBackoff::new();
    while !stop.load(Ordering::Acquire) {
        let action = match read(&mut buf) {
            Ok(len) => {
                backoff.reset();
                handler.on_complete(Ok(&buf[..len]))
            }
            Err(rusb::Error::Timeout) => {
                backoff.reset();
                continue;
            }
            Err(e) => {
                let status = map_rusb_error(e);
                if status == UsbStatus::NoDevice {
                    disconnected.store(true, Ordering::Release);
                }
                let action = handler.on_complete(Err(status.clone()));
                if action == RequestAction::Resubmit {
                    let delay = backoff.next_delay();
                    trace!("Read on {:#04x} failed ({}), retrying in {:?}", endpoint, status, delay);
                    thread::sleep(delay);
                }
                action
            }
        };
        if action == RequestAction::Release {
            break;
        }
    }
    trace!("Reader for {:#04x} finished", endpoint);
}

/// The VideoControl interface of `device`, if it is a video device
fn find_control_interface(device: &Device<Context>) -> Option<u8> {
    let config = device.active_config_descriptor().ok()?;
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            if desc.class_code() == VIDEO_CLASS && desc.sub_class_code() == VIDEO_CONTROL_SUBCLASS {
                return Some(desc.interface_number());
            }
        }
    }
    None
}

/// Every UVC device on the bus
pub fn list_video_devices() -> Result<Vec<VideoDeviceInfo>, UsbStatus> {
    let context = Context::new().map_err(map_rusb_error)?;
    let devices = context.devices().map_err(map_rusb_error)?;

    let mut found = Vec::new();
    for device in devices.iter() {
        let Some(control_interface) = find_control_interface(&device) else {
            continue;
        };
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!("Skipping device without descriptor: {}", e);
                continue;
            }
        };
        let product = device
            .open()
            .ok()
            .and_then(|handle| handle.read_product_string_ascii(&descriptor).ok());

        found.push(VideoDeviceInfo {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bus_number: device.bus_number(),
            address: device.address(),
            control_interface,
            product,
        });
    }
    Ok(found)
}

struct Reader {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// [`Transport`] over a libusb device handle
pub struct RusbTransport {
    context: Context,
    handle: Arc<RwLock<DeviceHandle<Context>>>,
    bus_number: u8,
    address: u8,
    control_interface: u8,
    config_index: u8,
    endpoint_types: HashMap<u8, TransferType>,
    detached: Mutex<HashSet<u8>>,
    readers: Mutex<HashMap<u64, Reader>>,
    next_request: AtomicU64,
    disconnected: Arc<AtomicBool>,
}

impl RusbTransport {
    /// Open the first video device matching `vendor_id:product_id`
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self, UsbStatus> {
        let context = Context::new().map_err(map_rusb_error)?;
        let devices = context.devices().map_err(map_rusb_error)?;

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }
            let Some(control_interface) = find_control_interface(&device) else {
                debug!(
                    "{:04x}:{:04x} on bus {} has no VideoControl interface",
                    vendor_id,
                    product_id,
                    device.bus_number()
                );
                continue;
            };
            return Self::from_device(context.clone(), device, control_interface);
        }
        Err(UsbStatus::NotFound)
    }

    fn from_device(
        context: Context,
        device: Device<Context>,
        control_interface: u8,
    ) -> Result<Self, UsbStatus> {
        let config = device.active_config_descriptor().map_err(map_rusb_error)?;
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

        let config_index = (0..descriptor.num_configurations())
            .find(|&i| {
                device
                    .config_descriptor(i)
                    .map(|c| c.number() == config.number())
                    .unwrap_or(false)
            })
            .unwrap_or(0);

        let mut endpoint_types = HashMap::new();
        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                for ep in desc.endpoint_descriptors() {
                    endpoint_types.insert(ep.address(), ep.transfer_type());
                }
            }
        }

        let handle = device.open().map_err(map_rusb_error)?;
        info!(
            "Opened video device {:04x}:{:04x} on bus {} address {}",
            descriptor.vendor_id(),
            descriptor.product_id(),
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            context,
            handle: Arc::new(RwLock::new(handle)),
            bus_number: device.bus_number(),
            address: device.address(),
            control_interface,
            config_index,
            endpoint_types,
            detached: Mutex::new(HashSet::new()),
            readers: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            disconnected: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Interface number of the VideoControl interface
    pub fn control_interface(&self) -> u8 {
        self.control_interface
    }

    fn readers(&self) -> MutexGuard<'_, HashMap<u64, Reader>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note(&self, err: rusb::Error) -> UsbStatus {
        let status = map_rusb_error(err);
        if status == UsbStatus::NoDevice {
            self.disconnected.store(true, Ordering::Release);
        }
        status
    }

    fn read_config_descriptor(&self, len: usize) -> Result<Vec<u8>, UsbStatus> {
        let handle = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        let mut buf = vec![0u8; len];
        let read = handle
            .read_control(
                0x80,
                GET_DESCRIPTOR,
                CONFIG_DESCRIPTOR_TYPE << 8 | self.config_index as u16,
                0,
                &mut buf,
                DESCRIPTOR_TIMEOUT,
            )
            .map_err(|e| self.note(e))?;
        buf.truncate(read);
        Ok(buf)
    }
}

impl Transport for RusbTransport {
    fn enumerate_descriptors(&self) -> Result<Vec<DescriptorBlock>, UsbStatus> {
        let header = self.read_config_descriptor(CONFIG_HEADER_LEN)?;
        if header.len() < 4 {
            return Err(UsbStatus::Io);
        }
        let total = u16::from_le_bytes([header[2], header[3]]) as usize;
        let raw = self.read_config_descriptor(total)?;
        if raw.len() < total {
            warn!("Configuration descriptor truncated: {} of {} bytes", raw.len(), total);
        }
        Ok(split_descriptors(&raw))
    }

    fn control_transfer(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbStatus> {
        let handle = self.handle.read().unwrap_or_else(PoisonError::into_inner);

        // CLEAR_FEATURE(ENDPOINT_HALT) also resets the host side data toggle
        if setup.request_type == 0x02 && setup.request == 0x01 && setup.value == 0 {
            return handle
                .clear_halt(setup.index as u8)
                .map(|()| 0)
                .map_err(|e| self.note(e));
        }

        let result = if setup.is_read() {
            handle.read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
        } else {
            handle.write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
        };
        trace!("Control transfer {}: {:?}", setup, result);
        result.map_err(|e| self.note(e))
    }

    fn open_interface(&self, interface: u8) -> Result<(), UsbStatus> {
        let mut handle = self.handle.write().unwrap_or_else(PoisonError::into_inner);

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => {
                        self.detached
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(interface);
                    }
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            self.note(e)
        })?;
        debug!("Claimed interface {}", interface);
        Ok(())
    }

    fn close_interface(&self, interface: u8) -> Result<(), UsbStatus> {
        let mut handle = self.handle.write().unwrap_or_else(PoisonError::into_inner);
        let released = handle.release_interface(interface).map_err(|e| self.note(e));

        let was_detached = self
            .detached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&interface);
        if was_detached {
            match handle.attach_kernel_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                ),
            }
        }
        released
    }

    fn submit_request(
        &self,
        endpoint: u8,
        buffer_len: usize,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<RequestHandle, UsbStatus> {
        let kind = match self.endpoint_types.get(&endpoint) {
            Some(TransferType::Bulk) => TransferType::Bulk,
            Some(TransferType::Interrupt) => TransferType::Interrupt,
            Some(other) => {
                warn!("Endpoint {:#04x} uses unsupported {:?} transfers", endpoint, other);
                return Err(UsbStatus::InvalidParam);
            }
            None => return Err(UsbStatus::NotFound),
        };
        if self.disconnected.load(Ordering::Acquire) {
            return Err(UsbStatus::NoDevice);
        }

        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = Arc::clone(&self.handle);
        let disconnected = Arc::clone(&self.disconnected);
        let stop = Arc::clone(&cancel);

        let thread = std::thread::Builder::new()
            .name(format!("usb-read-{:02x}", endpoint))
            .spawn(move || {
                run_reader(endpoint, buffer_len, &stop, &*handler, &disconnected, |buf| {
                    let handle = handle.read().unwrap_or_else(PoisonError::into_inner);
                    match kind {
                        TransferType::Interrupt => handle.read_interrupt(endpoint, buf, READ_POLL),
                        _ => handle.read_bulk(endpoint, buf, READ_POLL),
                    }
                });
            })
            .expect("Failed to spawn USB reader thread");

        self.readers().insert(id, Reader { cancel, thread });
        Ok(RequestHandle(id))
    }

    fn cancel_request(&self, handle: RequestHandle) {
        let Some(reader) = self.readers().remove(&handle.0) else {
            return;
        };
        reader.cancel.store(true, Ordering::Release);
        if reader.thread.thread().id() == std::thread::current().id() {
            return;
        }
        if reader.thread.join().is_err() {
            warn!("Reader thread for request {} panicked", handle.0);
        }
    }

    fn is_connected(&self) -> bool {
        if self.disconnected.load(Ordering::Acquire) {
            return false;
        }
        let present = self
            .context
            .devices()
            .map(|list| {
                list.iter()
                    .any(|d| d.bus_number() == self.bus_number && d.address() == self.address)
            })
            .unwrap_or(false);
        if !present {
            self.disconnected.store(true, Ordering::Release);
        }
        present
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        let readers: Vec<u64> = self.readers().keys().copied().collect();
        for id in readers {
            self.cancel_request(RequestHandle(id));
        }
    }
}
