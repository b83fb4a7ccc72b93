//! UVC descriptor parsing
//!
//! Decodes the ordered list of raw descriptor blocks a device exposes into
//! control-interface metadata (terminals and units) and per-streaming-interface
//! format/frame tables.
//!
//! Parsing runs in two passes:
//! 1. The VideoControl interface block range is scanned and every
//!    class-specific block is dispatched on its subtype. The header block
//!    records the protocol version and lists the streaming interfaces.
//! 2. Each listed streaming interface is scanned for format descriptors and
//!    the frame descriptors trailing them.
//!
//! The parser is defensive: unknown subtypes are skipped and a short block
//! stops contributing data for its entry. Devices in the field emit
//! non-conformant descriptors, so nothing here returns an error.

use crate::constants::{
    CS_INTERFACE, ENDPOINT_ADDRESS_MASK, ENDPOINT_DIR_IN, ENDPOINT_TRANSFER_INTERRUPT, ITT_CAMERA,
    USB_DT_ENDPOINT, USB_DT_INTERFACE, VcSubtype, VsSubtype,
};
use crate::fourcc::FourCc;
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace, warn};

/// One raw USB descriptor: bLength, bDescriptorType, subtype, payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorBlock {
    data: Vec<u8>,
}

impl DescriptorBlock {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// bDescriptorType (offset 1)
    pub fn descriptor_type(&self) -> Option<u8> {
        self.u8_at(1)
    }

    /// Class-specific subtype, or bInterfaceNumber for interface descriptors (offset 2)
    pub fn subtype(&self) -> Option<u8> {
        self.u8_at(2)
    }

    fn is_interface(&self) -> bool {
        self.descriptor_type() == Some(USB_DT_INTERFACE)
    }

    fn is_class_specific(&self) -> bool {
        self.descriptor_type() == Some(CS_INTERFACE)
    }

    fn u8_at(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    fn u16_at(&self, offset: usize) -> Option<u16> {
        self.data.get(offset..offset + 2).map(LittleEndian::read_u16)
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        self.data.get(offset..offset + 4).map(LittleEndian::read_u32)
    }

    /// Little-endian control bitmap of `size` bytes starting at `offset`
    fn bitmap_at(&self, offset: usize, size: usize) -> Option<u64> {
        let bytes = self.data.get(offset..offset + size)?;
        Some(
            bytes
                .iter()
                .take(8)
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        )
    }
}

/// Split a raw configuration descriptor into blocks using each bLength
///
/// A zero bLength or a block running past the end terminates the split;
/// the trailing partial block is kept so the parser can skip it.
pub fn split_descriptors(raw: &[u8]) -> Vec<DescriptorBlock> {
    let mut blocks = Vec::new();
    let mut offset = 0;

    while offset < raw.len() {
        let declared = raw[offset] as usize;
        if declared == 0 {
            warn!("Zero-length descriptor at offset {}, stopping", offset);
            break;
        }
        let end = (offset + declared).min(raw.len());
        blocks.push(DescriptorBlock::new(raw[offset..end].to_vec()));
        offset = end;
    }

    blocks
}

/// Camera input terminal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputTerminal {
    pub terminal_id: u8,
    pub terminal_type: u16,
    pub focal_length_min: u16,
    pub focal_length_max: u16,
    pub ocular_focal_length: u16,
    /// Camera controls bitmap
    pub controls: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectorUnit {
    pub unit_id: u8,
}

/// Post-capture processing unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingUnit {
    pub unit_id: u8,
    pub source_id: u8,
    /// Processing controls bitmap
    pub controls: u64,
}

/// Vendor extension unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionUnit {
    pub unit_id: u8,
    pub guid: [u8; 16],
    pub controls: u64,
}

/// Metadata collected from the VideoControl interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlInterface {
    pub interface_number: u8,
    /// bcdUVC from the header, e.g. 0x0110
    pub bcd_uvc: u16,
    /// dwClockFrequency (only reported by UVC 1.0 headers)
    pub clock_frequency: u32,
    pub streaming_interfaces: Vec<u8>,
    pub input_terminal: Option<InputTerminal>,
    pub selector_unit: Option<SelectorUnit>,
    pub processing_unit: Option<ProcessingUnit>,
    pub extension_units: Vec<ExtensionUnit>,
    /// Status interrupt IN endpoint, if the interface has one
    pub interrupt_endpoint: Option<u8>,
}

impl ControlInterface {
    /// First extension unit declared by the device
    pub fn extension_unit(&self) -> Option<&ExtensionUnit> {
        self.extension_units.first()
    }
}

/// Kind of format descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Uncompressed,
    Mjpeg,
    FrameBased,
}

/// Supported frame intervals in 100ns units
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameIntervals {
    Discrete(Vec<u32>),
    Continuous { min: u32, max: u32, step: u32 },
}

/// Upper bound on intervals expanded from a continuous range
pub const MAX_CONTINUOUS_INTERVALS: usize = 64;

impl FrameIntervals {
    /// Concrete, nonzero intervals this entry supports
    pub fn expand(&self) -> Vec<u32> {
        match self {
            FrameIntervals::Discrete(values) => {
                values.iter().copied().filter(|i| *i != 0).collect()
            }
            FrameIntervals::Continuous { min, max, step } => {
                if *min == 0 || min > max {
                    return Vec::new();
                }
                if *step == 0 {
                    return vec![*min];
                }
                let mut out = Vec::new();
                let mut current = *min;
                while current <= *max && out.len() < MAX_CONTINUOUS_INTERVALS {
                    out.push(current);
                    match current.checked_add(*step) {
                        Some(next) => current = next,
                        None => break,
                    }
                }
                out
            }
        }
    }
}

/// One (width, height) combination of a format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub frame_index: u8,
    pub capabilities: u8,
    pub width: u16,
    pub height: u16,
    pub min_bit_rate: u32,
    pub max_bit_rate: u32,
    /// dwMaxVideoFrameBufferSize (zero for frame-based formats)
    pub max_frame_buffer_size: u32,
    pub default_interval: u32,
    pub intervals: FrameIntervals,
    /// dwBytesPerLine (frame-based formats only)
    pub bytes_per_line: u32,
}

/// A format and the frame descriptors that trail it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub kind: FormatKind,
    pub format_index: u8,
    pub fourcc: FourCc,
    pub bits_per_pixel: u8,
    pub default_frame_index: u8,
    pub aspect_ratio_x: u8,
    pub aspect_ratio_y: u8,
    pub interlace_flags: u8,
    pub copy_protect: u8,
    /// Payload sizes vary frame to frame (compressed formats)
    pub variable_size: bool,
    pub frames: Vec<FrameDescriptor>,
}

/// Format table of one VideoStreaming interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingInterface {
    pub interface_number: u8,
    /// Read endpoint from the input header
    pub endpoint_address: Option<u8>,
    pub terminal_link: Option<u8>,
    pub formats: Vec<FormatDescriptor>,
}

/// Everything the parser extracts from a device's descriptors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptors {
    pub control: ControlInterface,
    pub streaming: Vec<StreamingInterface>,
}

impl DeviceDescriptors {
    pub fn streaming_interface(&self, interface_number: u8) -> Option<&StreamingInterface> {
        self.streaming
            .iter()
            .find(|s| s.interface_number == interface_number)
    }
}

/// Parse a device's descriptor blocks for the given VideoControl interface
pub fn parse_descriptors(blocks: &[DescriptorBlock], control_interface: u8) -> DeviceDescriptors {
    let mut control = ControlInterface {
        interface_number: control_interface,
        ..Default::default()
    };

    let Some((begin, end)) = control_block_range(blocks, control_interface) else {
        warn!(
            "No VideoControl interface {} in {} descriptor blocks",
            control_interface,
            blocks.len()
        );
        return DeviceDescriptors {
            control,
            streaming: Vec::new(),
        };
    };

    for block in &blocks[begin..end] {
        match block.descriptor_type() {
            Some(CS_INTERFACE) => parse_control_block(block, &mut control),
            Some(USB_DT_ENDPOINT) => parse_control_endpoint(block, &mut control),
            _ => {}
        }
    }

    let streaming = control
        .streaming_interfaces
        .iter()
        .map(|intf| scan_streaming(blocks, *intf))
        .collect();

    debug!(
        "Parsed UVC {:#06x} control interface {} with {} streaming interface(s)",
        control.bcd_uvc,
        control_interface,
        control.streaming_interfaces.len()
    );

    DeviceDescriptors { control, streaming }
}

/// Block index range covering the control interface (all alternate settings)
fn control_block_range(blocks: &[DescriptorBlock], interface: u8) -> Option<(usize, usize)> {
    let begin = blocks
        .iter()
        .position(|b| b.is_interface() && b.subtype() == Some(interface))?;
    let end = blocks[begin + 1..]
        .iter()
        .position(|b| b.is_interface() && b.subtype() != Some(interface))
        .map(|offset| begin + 1 + offset)
        .unwrap_or(blocks.len());
    Some((begin, end))
}

fn parse_control_block(block: &DescriptorBlock, control: &mut ControlInterface) {
    let Some(subtype) = block.subtype() else {
        return;
    };

    match VcSubtype::from_u8(subtype) {
        Some(VcSubtype::Header) => parse_control_header(block, control),
        Some(VcSubtype::InputTerminal) => parse_input_terminal(block, control),
        Some(VcSubtype::SelectorUnit) => {
            if let Some(unit_id) = block.u8_at(3) {
                control.selector_unit = Some(SelectorUnit { unit_id });
            }
        }
        Some(VcSubtype::ProcessingUnit) => parse_processing_unit(block, control),
        Some(VcSubtype::ExtensionUnit) => parse_extension_unit(block, control),
        Some(VcSubtype::OutputTerminal) => {}
        None => trace!("Skipping unknown VideoControl subtype {:#04x}", subtype),
    }
}

fn parse_control_header(block: &DescriptorBlock, control: &mut ControlInterface) {
    let Some(bcd_uvc) = block.u16_at(3) else {
        warn!("Truncated VideoControl header ({} bytes)", block.len());
        return;
    };
    control.bcd_uvc = bcd_uvc;

    control.clock_frequency = match bcd_uvc {
        0x0100 | 0x010a => block.u32_at(7).unwrap_or(0),
        0x0110 | 0x0150 => 0,
        other => {
            warn!(
                "Unrecognized bcdUVC {:#06x}, treating as UVC 1.0 for control block layout",
                other
            );
            block.u32_at(7).unwrap_or(0)
        }
    };

    let declared = block.u8_at(11).unwrap_or(0) as usize;
    let listed = block.as_bytes().get(12..).unwrap_or(&[]);
    if listed.len() < declared {
        warn!(
            "VideoControl header declares {} streaming interfaces but lists {}",
            declared,
            listed.len()
        );
    }
    control.streaming_interfaces = listed.iter().take(declared).copied().collect();
}

fn parse_input_terminal(block: &DescriptorBlock, control: &mut ControlInterface) {
    // Only camera-type input terminals are of interest
    if block.u16_at(4) != Some(ITT_CAMERA) {
        return;
    }

    let (Some(terminal_id), Some(min), Some(max), Some(ocular), Some(size)) = (
        block.u8_at(3),
        block.u16_at(8),
        block.u16_at(10),
        block.u16_at(12),
        block.u8_at(14),
    ) else {
        warn!("Truncated camera input terminal ({} bytes)", block.len());
        return;
    };

    control.input_terminal = Some(InputTerminal {
        terminal_id,
        terminal_type: ITT_CAMERA,
        focal_length_min: min,
        focal_length_max: max,
        ocular_focal_length: ocular,
        controls: block.bitmap_at(15, size as usize).unwrap_or(0),
    });
}

fn parse_processing_unit(block: &DescriptorBlock, control: &mut ControlInterface) {
    let (Some(unit_id), Some(source_id)) = (block.u8_at(3), block.u8_at(4)) else {
        warn!("Truncated processing unit ({} bytes)", block.len());
        return;
    };
    let size = block.u8_at(7).unwrap_or(0) as usize;

    control.processing_unit = Some(ProcessingUnit {
        unit_id,
        source_id,
        controls: block.bitmap_at(8, size).unwrap_or(0),
    });
}

fn parse_extension_unit(block: &DescriptorBlock, control: &mut ControlInterface) {
    let (Some(unit_id), Some(guid), Some(pins)) = (
        block.u8_at(3),
        block.as_bytes().get(4..20),
        block.u8_at(21),
    ) else {
        warn!("Truncated extension unit ({} bytes)", block.len());
        return;
    };

    let size_offset = 22 + pins as usize;
    let size = block.u8_at(size_offset).unwrap_or(0) as usize;

    let mut unit = ExtensionUnit {
        unit_id,
        ..Default::default()
    };
    unit.guid.copy_from_slice(guid);
    unit.controls = block.bitmap_at(size_offset + 1, size).unwrap_or(0);
    control.extension_units.push(unit);
}

fn parse_control_endpoint(block: &DescriptorBlock, control: &mut ControlInterface) {
    let (Some(address), Some(attributes)) = (block.u8_at(2), block.u8_at(3)) else {
        return;
    };
    if address & ENDPOINT_DIR_IN != 0 && attributes & 0x03 == ENDPOINT_TRANSFER_INTERRUPT {
        control.interrupt_endpoint = Some(address);
    }
}

/// Collect the format/frame table of one streaming interface
fn scan_streaming(blocks: &[DescriptorBlock], interface_number: u8) -> StreamingInterface {
    let mut streaming = StreamingInterface {
        interface_number,
        ..Default::default()
    };

    let Some(start) = blocks
        .iter()
        .position(|b| b.is_interface() && b.subtype() == Some(interface_number))
    else {
        warn!("Streaming interface {} not found in descriptors", interface_number);
        return streaming;
    };

    for block in blocks[start + 1..].iter().take_while(|b| !b.is_interface()) {
        if !block.is_class_specific() {
            continue;
        }
        let Some(subtype) = block.subtype() else {
            continue;
        };

        match VsSubtype::from_u8(subtype) {
            Some(VsSubtype::InputHeader) => {
                streaming.endpoint_address = block.u8_at(6).map(|a| a & ENDPOINT_ADDRESS_MASK);
                streaming.terminal_link = block.u8_at(8);
            }
            Some(VsSubtype::FormatUncompressed) => {
                push_format(&mut streaming, parse_format_uncompressed(block))
            }
            Some(VsSubtype::FormatMjpeg) => push_format(&mut streaming, parse_format_mjpeg(block)),
            Some(VsSubtype::FormatFrameBased) => {
                push_format(&mut streaming, parse_format_frame_based(block))
            }
            Some(VsSubtype::FrameUncompressed) | Some(VsSubtype::FrameMjpeg) => {
                push_frame(&mut streaming, parse_frame_uncompressed(block))
            }
            Some(VsSubtype::FrameFrameBased) => {
                push_frame(&mut streaming, parse_frame_frame_based(block))
            }
            _ => trace!(
                "Skipping VideoStreaming subtype {:#04x} on interface {}",
                subtype, interface_number
            ),
        }
    }

    streaming
}

fn push_format(streaming: &mut StreamingInterface, format: Option<FormatDescriptor>) {
    match format {
        Some(format) => streaming.formats.push(format),
        None => warn!(
            "Skipping truncated format descriptor on interface {}",
            streaming.interface_number
        ),
    }
}

fn push_frame(streaming: &mut StreamingInterface, frame: Option<FrameDescriptor>) {
    let interface_number = streaming.interface_number;
    match (streaming.formats.last_mut(), frame) {
        (Some(format), Some(frame)) => format.frames.push(frame),
        (None, _) => warn!(
            "Frame descriptor before any format on interface {}, skipping",
            interface_number
        ),
        (_, None) => warn!(
            "Skipping truncated frame descriptor on interface {}",
            interface_number
        ),
    }
}

fn parse_format_uncompressed(block: &DescriptorBlock) -> Option<FormatDescriptor> {
    Some(FormatDescriptor {
        kind: FormatKind::Uncompressed,
        format_index: block.u8_at(3)?,
        fourcc: FourCc::from_guid(block.as_bytes().get(5..21)?)?,
        bits_per_pixel: block.u8_at(21)?,
        default_frame_index: block.u8_at(22)?,
        aspect_ratio_x: block.u8_at(23)?,
        aspect_ratio_y: block.u8_at(24)?,
        interlace_flags: block.u8_at(25)?,
        copy_protect: block.u8_at(26)?,
        variable_size: false,
        frames: Vec::new(),
    })
}

fn parse_format_mjpeg(block: &DescriptorBlock) -> Option<FormatDescriptor> {
    Some(FormatDescriptor {
        kind: FormatKind::Mjpeg,
        format_index: block.u8_at(3)?,
        fourcc: FourCc::MJPG,
        bits_per_pixel: 0,
        default_frame_index: block.u8_at(6)?,
        aspect_ratio_x: block.u8_at(7)?,
        aspect_ratio_y: block.u8_at(8)?,
        interlace_flags: block.u8_at(9)?,
        copy_protect: block.u8_at(10)?,
        variable_size: true,
        frames: Vec::new(),
    })
}

fn parse_format_frame_based(block: &DescriptorBlock) -> Option<FormatDescriptor> {
    Some(FormatDescriptor {
        kind: FormatKind::FrameBased,
        format_index: block.u8_at(3)?,
        fourcc: FourCc::from_guid(block.as_bytes().get(5..21)?)?,
        bits_per_pixel: block.u8_at(21)?,
        default_frame_index: block.u8_at(22)?,
        aspect_ratio_x: block.u8_at(23)?,
        aspect_ratio_y: block.u8_at(24)?,
        interlace_flags: block.u8_at(25)?,
        copy_protect: block.u8_at(26)?,
        variable_size: block.u8_at(27)? != 0,
        frames: Vec::new(),
    })
}

/// Uncompressed and MJPEG frame descriptors share one layout
fn parse_frame_uncompressed(block: &DescriptorBlock) -> Option<FrameDescriptor> {
    let interval_type = block.u8_at(25)?;
    Some(FrameDescriptor {
        frame_index: block.u8_at(3)?,
        capabilities: block.u8_at(4)?,
        width: block.u16_at(5)?,
        height: block.u16_at(7)?,
        min_bit_rate: block.u32_at(9)?,
        max_bit_rate: block.u32_at(13)?,
        max_frame_buffer_size: block.u32_at(17)?,
        default_interval: block.u32_at(21)?,
        intervals: parse_intervals(block, interval_type, 26)?,
        bytes_per_line: 0,
    })
}

fn parse_frame_frame_based(block: &DescriptorBlock) -> Option<FrameDescriptor> {
    let interval_type = block.u8_at(21)?;
    Some(FrameDescriptor {
        frame_index: block.u8_at(3)?,
        capabilities: block.u8_at(4)?,
        width: block.u16_at(5)?,
        height: block.u16_at(7)?,
        min_bit_rate: block.u32_at(9)?,
        max_bit_rate: block.u32_at(13)?,
        max_frame_buffer_size: 0,
        default_interval: block.u32_at(17)?,
        bytes_per_line: block.u32_at(22)?,
        intervals: parse_intervals(block, interval_type, 26)?,
    })
}

/// bFrameIntervalType 0 means a continuous min/max/step range
fn parse_intervals(block: &DescriptorBlock, interval_type: u8, offset: usize) -> Option<FrameIntervals> {
    if interval_type == 0 {
        return Some(FrameIntervals::Continuous {
            min: block.u32_at(offset)?,
            max: block.u32_at(offset + 4)?,
            step: block.u32_at(offset + 8)?,
        });
    }

    let values: Vec<u32> = (0..interval_type as usize)
        .map_while(|i| block.u32_at(offset + i * 4))
        .collect();
    if values.len() < interval_type as usize {
        warn!(
            "Frame descriptor declares {} intervals but only {} fit in {} bytes",
            interval_type,
            values.len(),
            block.len()
        );
    }
    Some(FrameIntervals::Discrete(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interface(number: u8, class: u8, subclass: u8) -> DescriptorBlock {
        DescriptorBlock::new(vec![9, USB_DT_INTERFACE, number, 0, 1, class, subclass, 0, 0])
    }

    #[test]
    fn test_split_descriptors() {
        let raw = [3u8, 0x24, 0x01, 4, 0x24, 0x02, 0xff, 5, 0x05];
        let blocks = split_descriptors(&raw);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].as_bytes(), &[3, 0x24, 0x01]);
        assert_eq!(blocks[1].subtype(), Some(0x02));
        // Trailing block ran past the end and is kept truncated
        assert_eq!(blocks[2].len(), 2);
    }

    #[test]
    fn test_split_stops_on_zero_length() {
        let raw = [3u8, 0x24, 0x01, 0, 0x24, 0x02];
        assert_eq!(split_descriptors(&raw).len(), 1);
    }

    #[test]
    fn test_bitmap_is_little_endian() {
        let block = DescriptorBlock::new(vec![0, 0, 0, 0x0f, 0x01, 0x80]);
        assert_eq!(block.bitmap_at(3, 3), Some(0x80010f));
        assert_eq!(block.bitmap_at(4, 5), None);
    }

    #[test]
    fn test_control_range_spans_alternate_settings() {
        let blocks = vec![
            interface(0, 0x0e, 0x01),
            DescriptorBlock::new(vec![5, CS_INTERFACE, 0x04, 7, 0]),
            interface(0, 0x0e, 0x01),
            DescriptorBlock::new(vec![5, CS_INTERFACE, 0x04, 9, 0]),
            interface(1, 0x0e, 0x02),
        ];
        assert_eq!(control_block_range(&blocks, 0), Some((0, 4)));
        assert_eq!(control_block_range(&blocks, 1), Some((4, 5)));
        assert_eq!(control_block_range(&blocks, 3), None);
    }

    #[test]
    fn test_missing_control_interface_yields_empty_tables() {
        let parsed = parse_descriptors(&[interface(2, 0x0e, 0x02)], 0);
        assert!(parsed.streaming.is_empty());
        assert_eq!(parsed.control.bcd_uvc, 0);
    }

    #[test]
    fn test_continuous_intervals_expand() {
        let range = FrameIntervals::Continuous {
            min: 333_333,
            max: 1_000_000,
            step: 333_333,
        };
        assert_eq!(range.expand(), vec![333_333, 666_666, 999_999]);

        let fixed = FrameIntervals::Continuous {
            min: 333_333,
            max: 333_333,
            step: 0,
        };
        assert_eq!(fixed.expand(), vec![333_333]);

        let tiny_step = FrameIntervals::Continuous {
            min: 1,
            max: u32::MAX,
            step: 1,
        };
        assert_eq!(tiny_step.expand().len(), MAX_CONTINUOUS_INTERVALS);
    }

    #[test]
    fn test_discrete_intervals_skip_zero() {
        let list = FrameIntervals::Discrete(vec![333_333, 0, 666_666]);
        assert_eq!(list.expand(), vec![333_333, 666_666]);
    }
}
