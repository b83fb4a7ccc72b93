//! UVC and USB constants
//!
//! Descriptor types, class-specific subtypes, request codes and control
//! selectors from the USB Video Class specification (appendix A).

/// Standard interface descriptor type
pub const USB_DT_INTERFACE: u8 = 0x04;

/// Standard endpoint descriptor type
pub const USB_DT_ENDPOINT: u8 = 0x05;

/// Class-specific interface descriptor type
pub const CS_INTERFACE: u8 = 0x24;

/// Request type for class-specific SET requests (host to device, interface)
pub const REQ_TYPE_SET: u8 = 0x21;

/// Request type for class-specific GET requests (device to host, interface)
pub const REQ_TYPE_GET: u8 = 0xa1;

/// Request type for standard requests addressed to an endpoint
pub const REQ_TYPE_ENDPOINT_STANDARD: u8 = 0x02;

/// Standard CLEAR_FEATURE request
pub const REQ_CLEAR_FEATURE: u8 = 0x01;

/// ENDPOINT_HALT feature selector
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/// Camera input terminal type (B.2)
pub const ITT_CAMERA: u16 = 0x0201;

/// Endpoint direction bit (IN when set)
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Mask applied to bEndpointAddress to keep the direction and number bits
pub const ENDPOINT_ADDRESS_MASK: u8 = 0x8f;

/// Interrupt transfer type in bmAttributes
pub const ENDPOINT_TRANSFER_INTERRUPT: u8 = 0x03;

/// Length of a frame interval in 100ns units per second
pub const INTERVALS_PER_SECOND: u32 = 10_000_000;

/// VideoControl interface descriptor subtypes (A.5)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcSubtype {
    Header = 0x01,
    InputTerminal = 0x02,
    OutputTerminal = 0x03,
    SelectorUnit = 0x04,
    ProcessingUnit = 0x05,
    ExtensionUnit = 0x06,
}

impl VcSubtype {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Header),
            0x02 => Some(Self::InputTerminal),
            0x03 => Some(Self::OutputTerminal),
            0x04 => Some(Self::SelectorUnit),
            0x05 => Some(Self::ProcessingUnit),
            0x06 => Some(Self::ExtensionUnit),
            _ => None,
        }
    }
}

/// VideoStreaming interface descriptor subtypes (A.6)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsSubtype {
    InputHeader = 0x01,
    OutputHeader = 0x02,
    StillImageFrame = 0x03,
    FormatUncompressed = 0x04,
    FrameUncompressed = 0x05,
    FormatMjpeg = 0x06,
    FrameMjpeg = 0x07,
    FormatMpeg2ts = 0x0a,
    FormatDv = 0x0c,
    ColorFormat = 0x0d,
    FormatFrameBased = 0x10,
    FrameFrameBased = 0x11,
    FormatStreamBased = 0x12,
}

impl VsSubtype {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::InputHeader),
            0x02 => Some(Self::OutputHeader),
            0x03 => Some(Self::StillImageFrame),
            0x04 => Some(Self::FormatUncompressed),
            0x05 => Some(Self::FrameUncompressed),
            0x06 => Some(Self::FormatMjpeg),
            0x07 => Some(Self::FrameMjpeg),
            0x0a => Some(Self::FormatMpeg2ts),
            0x0c => Some(Self::FormatDv),
            0x0d => Some(Self::ColorFormat),
            0x10 => Some(Self::FormatFrameBased),
            0x11 => Some(Self::FrameFrameBased),
            0x12 => Some(Self::FormatStreamBased),
            _ => None,
        }
    }
}

/// UVC request codes (A.8)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCode {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

impl RequestCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::SetCur),
            0x81 => Some(Self::GetCur),
            0x82 => Some(Self::GetMin),
            0x83 => Some(Self::GetMax),
            0x84 => Some(Self::GetRes),
            0x85 => Some(Self::GetLen),
            0x86 => Some(Self::GetInfo),
            0x87 => Some(Self::GetDef),
            _ => None,
        }
    }

    /// Whether this request moves data from host to device
    pub fn is_set(self) -> bool {
        self == Self::SetCur
    }

    /// The bmRequestType byte matching this request's direction
    pub fn request_type(self) -> u8 {
        if self.is_set() {
            REQ_TYPE_SET
        } else {
            REQ_TYPE_GET
        }
    }
}

/// VideoStreaming interface control selectors (A.9.8)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsControlSelector {
    Probe = 0x01,
    Commit = 0x02,
    StillProbe = 0x03,
    StillCommit = 0x04,
    StillImageTrigger = 0x05,
    StreamErrorCode = 0x06,
    GenerateKeyFrame = 0x07,
    UpdateFrameSegment = 0x08,
    SyncDelay = 0x09,
}

impl VsControlSelector {
    /// wValue for a control request on this selector
    pub fn w_value(self) -> u16 {
        (self as u16) << 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_code_direction() {
        assert_eq!(RequestCode::SetCur.request_type(), 0x21);
        assert_eq!(RequestCode::GetCur.request_type(), 0xa1);
        assert_eq!(RequestCode::GetMax.request_type(), 0xa1);
        assert_eq!(RequestCode::from_u8(0x87), Some(RequestCode::GetDef));
        assert_eq!(RequestCode::from_u8(0x42), None);
    }

    #[test]
    fn test_selector_w_value() {
        assert_eq!(VsControlSelector::Probe.w_value(), 0x0100);
        assert_eq!(VsControlSelector::Commit.w_value(), 0x0200);
    }

    #[test]
    fn test_subtype_lookup() {
        assert_eq!(VcSubtype::from_u8(0x06), Some(VcSubtype::ExtensionUnit));
        assert_eq!(VcSubtype::from_u8(0x09), None);
        assert_eq!(VsSubtype::from_u8(0x11), Some(VsSubtype::FrameFrameBased));
        assert_eq!(VsSubtype::from_u8(0x0b), None);
    }
}
