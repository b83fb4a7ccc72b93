//! Raw descriptor builders for tests and benchmarks
//!
//! Each helper returns one [`DescriptorBlock`] laid out exactly as a device
//! would report it, so tests can assemble descriptor sets for cameras that
//! do not exist.
//!
//! # Example
//!
//! ```
//! use protocol::test_utils::simple_camera;
//! use protocol::{derive_profiles, parse_descriptors};
//!
//! let parsed = parse_descriptors(&simple_camera(0x0110), 0);
//! assert_eq!(derive_profiles(&parsed).len(), 2);
//! ```

use crate::constants::{
    CS_INTERFACE, ENDPOINT_TRANSFER_INTERRUPT, ITT_CAMERA, USB_DT_ENDPOINT, USB_DT_INTERFACE,
    VcSubtype, VsSubtype,
};
use crate::descriptors::DescriptorBlock;

/// Read endpoint used by [`simple_camera`]
pub const TEST_STREAM_ENDPOINT: u8 = 0x81;

/// Status interrupt endpoint used by [`simple_camera`]
pub const TEST_INTERRUPT_ENDPOINT: u8 = 0x83;

/// Max video frame buffer size of the 640x480 YUYV frame in [`simple_camera`]
pub const TEST_FRAME_BUFFER_SIZE: u32 = 640 * 480 * 2;

fn finish(mut data: Vec<u8>) -> DescriptorBlock {
    data[0] = data.len() as u8;
    DescriptorBlock::new(data)
}

/// Standard interface descriptor (subclass 1 = control, 2 = streaming)
pub fn interface(number: u8, alternate: u8, subclass: u8) -> DescriptorBlock {
    DescriptorBlock::new(vec![9, USB_DT_INTERFACE, number, alternate, 1, 0x0e, subclass, 0, 0])
}

/// Standard endpoint descriptor
pub fn endpoint(address: u8, attributes: u8, max_packet: u16) -> DescriptorBlock {
    let mut data = vec![7, USB_DT_ENDPOINT, address, attributes];
    data.extend_from_slice(&max_packet.to_le_bytes());
    data.push(8);
    DescriptorBlock::new(data)
}

pub fn interrupt_endpoint(address: u8) -> DescriptorBlock {
    endpoint(address, ENDPOINT_TRANSFER_INTERRUPT, 16)
}

pub fn vc_header(bcd_uvc: u16, clock_frequency: u32, streaming_interfaces: &[u8]) -> DescriptorBlock {
    let mut data = vec![0, CS_INTERFACE, VcSubtype::Header as u8];
    data.extend_from_slice(&bcd_uvc.to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&clock_frequency.to_le_bytes());
    data.push(streaming_interfaces.len() as u8);
    data.extend_from_slice(streaming_interfaces);
    finish(data)
}

pub fn camera_terminal(terminal_id: u8, focal: (u16, u16, u16), controls: &[u8]) -> DescriptorBlock {
    let mut data = vec![0, CS_INTERFACE, VcSubtype::InputTerminal as u8, terminal_id];
    data.extend_from_slice(&ITT_CAMERA.to_le_bytes());
    data.extend_from_slice(&[0, 0]);
    data.extend_from_slice(&focal.0.to_le_bytes());
    data.extend_from_slice(&focal.1.to_le_bytes());
    data.extend_from_slice(&focal.2.to_le_bytes());
    data.push(controls.len() as u8);
    data.extend_from_slice(controls);
    finish(data)
}

pub fn selector_unit(unit_id: u8) -> DescriptorBlock {
    finish(vec![0, CS_INTERFACE, VcSubtype::SelectorUnit as u8, unit_id, 1, 1, 0])
}

pub fn processing_unit(unit_id: u8, source_id: u8, controls: &[u8]) -> DescriptorBlock {
    let mut data = vec![0, CS_INTERFACE, VcSubtype::ProcessingUnit as u8, unit_id, source_id];
    data.extend_from_slice(&0u16.to_le_bytes());
    data.push(controls.len() as u8);
    data.extend_from_slice(controls);
    data.extend_from_slice(&[0, 0]);
    finish(data)
}

pub fn extension_unit(unit_id: u8, guid: [u8; 16], source_ids: &[u8], controls: &[u8]) -> DescriptorBlock {
    let mut data = vec![0, CS_INTERFACE, VcSubtype::ExtensionUnit as u8, unit_id];
    data.extend_from_slice(&guid);
    data.push((controls.len() * 8) as u8);
    data.push(source_ids.len() as u8);
    data.extend_from_slice(source_ids);
    data.push(controls.len() as u8);
    data.extend_from_slice(controls);
    data.push(0);
    finish(data)
}

pub fn vs_input_header(num_formats: u8, endpoint_address: u8, terminal_link: u8) -> DescriptorBlock {
    let mut data = vec![0, CS_INTERFACE, VsSubtype::InputHeader as u8, num_formats];
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&[endpoint_address, 0, terminal_link, 0, 0, 0, 1, 0]);
    finish(data)
}

/// A format GUID whose leading bytes are the given code
pub fn guid_for(code: [u8; 4]) -> [u8; 16] {
    let mut guid = [
        0, 0, 0, 0, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b, 0x71,
    ];
    guid[..4].copy_from_slice(&code);
    guid
}

pub fn format_uncompressed(format_index: u8, num_frames: u8, code: [u8; 4], bits_per_pixel: u8) -> DescriptorBlock {
    let mut data = vec![0, CS_INTERFACE, VsSubtype::FormatUncompressed as u8, format_index, num_frames];
    data.extend_from_slice(&guid_for(code));
    data.extend_from_slice(&[bits_per_pixel, 1, 0, 0, 0, 0]);
    finish(data)
}

pub fn format_mjpeg(format_index: u8, num_frames: u8) -> DescriptorBlock {
    finish(vec![
        0,
        CS_INTERFACE,
        VsSubtype::FormatMjpeg as u8,
        format_index,
        num_frames,
        1,
        1,
        0,
        0,
        0,
        0,
    ])
}

pub fn format_frame_based(format_index: u8, num_frames: u8, code: [u8; 4], variable_size: bool) -> DescriptorBlock {
    let mut data = vec![0, CS_INTERFACE, VsSubtype::FormatFrameBased as u8, format_index, num_frames];
    data.extend_from_slice(&guid_for(code));
    data.extend_from_slice(&[16, 1, 0, 0, 0, 0, u8::from(variable_size)]);
    finish(data)
}

fn frame_header(subtype: VsSubtype, frame_index: u8, width: u16, height: u16) -> Vec<u8> {
    let mut data = vec![0, CS_INTERFACE, subtype as u8, frame_index, 0];
    data.extend_from_slice(&width.to_le_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    data.extend_from_slice(&1_000_000u32.to_le_bytes());
    data.extend_from_slice(&100_000_000u32.to_le_bytes());
    data
}

/// Uncompressed frame with a discrete interval list
pub fn frame_uncompressed(frame_index: u8, width: u16, height: u16, max_buffer: u32, intervals: &[u32]) -> DescriptorBlock {
    discrete_frame(VsSubtype::FrameUncompressed, frame_index, width, height, max_buffer, intervals)
}

/// MJPEG frame with a discrete interval list
pub fn frame_mjpeg(frame_index: u8, width: u16, height: u16, max_buffer: u32, intervals: &[u32]) -> DescriptorBlock {
    discrete_frame(VsSubtype::FrameMjpeg, frame_index, width, height, max_buffer, intervals)
}

fn discrete_frame(
    subtype: VsSubtype,
    frame_index: u8,
    width: u16,
    height: u16,
    max_buffer: u32,
    intervals: &[u32],
) -> DescriptorBlock {
    let mut data = frame_header(subtype, frame_index, width, height);
    data.extend_from_slice(&max_buffer.to_le_bytes());
    data.extend_from_slice(&intervals.first().copied().unwrap_or(0).to_le_bytes());
    data.push(intervals.len() as u8);
    for interval in intervals {
        data.extend_from_slice(&interval.to_le_bytes());
    }
    finish(data)
}

/// Uncompressed frame with a continuous min/max/step interval range
pub fn frame_continuous(frame_index: u8, width: u16, height: u16, max_buffer: u32, range: (u32, u32, u32)) -> DescriptorBlock {
    let mut data = frame_header(VsSubtype::FrameUncompressed, frame_index, width, height);
    data.extend_from_slice(&max_buffer.to_le_bytes());
    data.extend_from_slice(&range.0.to_le_bytes());
    data.push(0);
    data.extend_from_slice(&range.0.to_le_bytes());
    data.extend_from_slice(&range.1.to_le_bytes());
    data.extend_from_slice(&range.2.to_le_bytes());
    finish(data)
}

/// Frame-based frame with a discrete interval list
pub fn frame_frame_based(frame_index: u8, width: u16, height: u16, intervals: &[u32]) -> DescriptorBlock {
    let mut data = frame_header(VsSubtype::FrameFrameBased, frame_index, width, height);
    data.extend_from_slice(&intervals.first().copied().unwrap_or(0).to_le_bytes());
    data.push(intervals.len() as u8);
    data.extend_from_slice(&0u32.to_le_bytes());
    for interval in intervals {
        data.extend_from_slice(&interval.to_le_bytes());
    }
    finish(data)
}

/// Control interface 0 plus streaming interface 1 with one YUYV 640x480
/// format at 30 and 15 fps
pub fn simple_camera(bcd_uvc: u16) -> Vec<DescriptorBlock> {
    vec![
        interface(0, 0, 1),
        vc_header(bcd_uvc, 48_000_000, &[1]),
        camera_terminal(1, (0, 0, 0), &[0x0a, 0x00, 0x00]),
        processing_unit(2, 1, &[0x5b, 0x17]),
        interrupt_endpoint(TEST_INTERRUPT_ENDPOINT),
        interface(1, 0, 2),
        vs_input_header(1, TEST_STREAM_ENDPOINT, 3),
        format_uncompressed(1, 1, *b"YUY2", 16),
        frame_uncompressed(1, 640, 480, TEST_FRAME_BUFFER_SIZE, &[333_333, 666_666]),
    ]
}
