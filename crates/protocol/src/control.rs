//! Probe/Commit stream control block
//!
//! The block is byte-packed little-endian with three sizes selected by the
//! device's bcdUVC. Fields past the chosen size are never written and decode
//! as zero.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// bmHint bit asking the device to keep dwFrameInterval fixed
pub const HINT_FRAME_INTERVAL: u16 = 0x0001;

/// Wire size of the control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlBlockLength {
    /// UVC 1.0 / 1.0a
    Uvc10,
    /// UVC 1.1
    Uvc11,
    /// UVC 1.5
    Uvc15,
}

impl ControlBlockLength {
    /// Select the layout for a bcdUVC value; unknown versions use the 1.0 layout
    pub fn for_version(bcd_uvc: u16) -> Self {
        match bcd_uvc {
            0x0100 | 0x010a => Self::Uvc10,
            0x0110 => Self::Uvc11,
            0x0150 => Self::Uvc15,
            other => {
                warn!("Unknown bcdUVC {:#06x}, using 26-byte control block", other);
                Self::Uvc10
            }
        }
    }

    pub fn from_len(len: usize) -> Result<Self> {
        match len {
            26 => Ok(Self::Uvc10),
            34 => Ok(Self::Uvc11),
            48 => Ok(Self::Uvc15),
            other => Err(ProtocolError::InvalidControlLength(other)),
        }
    }

    pub fn len(self) -> usize {
        match self {
            Self::Uvc10 => 26,
            Self::Uvc11 => 34,
            Self::Uvc15 => 48,
        }
    }
}

/// Negotiated streaming parameters exchanged on the probe/commit selectors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamControlBlock {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,

    // UVC 1.1
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,

    // UVC 1.5
    pub usage: u8,
    pub bit_depth_luma: u8,
    pub settings: u8,
    pub max_number_of_ref_frames_plus1: u8,
    pub rate_control_modes: u16,
    pub layout_per_stream: u64,
}

impl StreamControlBlock {
    /// Serialize into exactly `length.len()` bytes
    pub fn encode(&self, length: ControlBlockLength) -> Vec<u8> {
        let mut buf = vec![0u8; length.len()];

        LittleEndian::write_u16(&mut buf[0..2], self.hint);
        buf[2] = self.format_index;
        buf[3] = self.frame_index;
        LittleEndian::write_u32(&mut buf[4..8], self.frame_interval);
        LittleEndian::write_u16(&mut buf[8..10], self.key_frame_rate);
        LittleEndian::write_u16(&mut buf[10..12], self.p_frame_rate);
        LittleEndian::write_u16(&mut buf[12..14], self.comp_quality);
        LittleEndian::write_u16(&mut buf[14..16], self.comp_window_size);
        LittleEndian::write_u16(&mut buf[16..18], self.delay);
        LittleEndian::write_u32(&mut buf[18..22], self.max_video_frame_size);
        LittleEndian::write_u32(&mut buf[22..26], self.max_payload_transfer_size);

        if length != ControlBlockLength::Uvc10 {
            LittleEndian::write_u32(&mut buf[26..30], self.clock_frequency);
            buf[30] = self.framing_info;
            buf[31] = self.preferred_version;
            buf[32] = self.min_version;
            buf[33] = self.max_version;
        }

        if length == ControlBlockLength::Uvc15 {
            buf[34] = self.usage;
            buf[35] = self.bit_depth_luma;
            buf[36] = self.settings;
            buf[37] = self.max_number_of_ref_frames_plus1;
            LittleEndian::write_u16(&mut buf[38..40], self.rate_control_modes);
            LittleEndian::write_u64(&mut buf[40..48], self.layout_per_stream);
        }

        buf
    }

    /// Deserialize a block of the given layout
    ///
    /// 26-byte blocks carry no clock frequency; `header_clock_frequency` (the
    /// VideoControl header's dwClockFrequency) is used instead.
    pub fn decode(buf: &[u8], length: ControlBlockLength, header_clock_frequency: u32) -> Result<Self> {
        let needed = length.len();
        if buf.len() < needed {
            return Err(ProtocolError::BufferTooSmall {
                needed,
                available: buf.len(),
            });
        }

        let mut block = Self {
            hint: LittleEndian::read_u16(&buf[0..2]),
            format_index: buf[2],
            frame_index: buf[3],
            frame_interval: LittleEndian::read_u32(&buf[4..8]),
            key_frame_rate: LittleEndian::read_u16(&buf[8..10]),
            p_frame_rate: LittleEndian::read_u16(&buf[10..12]),
            comp_quality: LittleEndian::read_u16(&buf[12..14]),
            comp_window_size: LittleEndian::read_u16(&buf[14..16]),
            delay: LittleEndian::read_u16(&buf[16..18]),
            max_video_frame_size: LittleEndian::read_u32(&buf[18..22]),
            max_payload_transfer_size: LittleEndian::read_u32(&buf[22..26]),
            clock_frequency: header_clock_frequency,
            ..Default::default()
        };

        if length != ControlBlockLength::Uvc10 {
            block.clock_frequency = LittleEndian::read_u32(&buf[26..30]);
            block.framing_info = buf[30];
            block.preferred_version = buf[31];
            block.min_version = buf[32];
            block.max_version = buf[33];
        }

        if length == ControlBlockLength::Uvc15 {
            block.usage = buf[34];
            block.bit_depth_luma = buf[35];
            block.settings = buf[36];
            block.max_number_of_ref_frames_plus1 = buf[37];
            block.rate_control_modes = LittleEndian::read_u16(&buf[38..40]);
            block.layout_per_stream = LittleEndian::read_u64(&buf[40..48]);
        }

        Ok(block)
    }

    /// Copy of this block as sent on a probe SET_CUR: device-owned size fields zeroed
    pub fn for_probe(&self) -> Self {
        Self {
            max_video_frame_size: 0,
            max_payload_transfer_size: 0,
            ..self.clone()
        }
    }
}
