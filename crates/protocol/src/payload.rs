//! Stream payload header
//!
//! Every transfer on a streaming endpoint starts with a header:
//! byte 0 is the header length (including itself), byte 1 a bitfield.
//! Optional PTS and SCR fields follow when flagged.

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Largest header a device can send (2 + PTS 4 + SCR 6)
pub const MAX_PAYLOAD_HEADER_LEN: usize = 12;

pub const HEADER_FID: u8 = 0x01;
pub const HEADER_EOF: u8 = 0x02;
pub const HEADER_PTS: u8 = 0x04;
pub const HEADER_SCR: u8 = 0x08;
pub const HEADER_RES: u8 = 0x10;
pub const HEADER_STI: u8 = 0x20;
pub const HEADER_ERR: u8 = 0x40;
pub const HEADER_EOH: u8 = 0x80;

/// Decoded payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub length: usize,
    pub info: u8,
}

impl PayloadHeader {
    /// Read the header at the start of `payload`
    ///
    /// Fails if the payload cannot hold the two fixed bytes or the declared
    /// header length.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(ProtocolError::BufferTooSmall {
                needed: 2,
                available: payload.len(),
            });
        }

        let length = payload[0] as usize;
        if length < 2 || length > payload.len() {
            return Err(ProtocolError::InvalidHeaderLength {
                header: length,
                payload: payload.len(),
            });
        }

        Ok(Self {
            length,
            info: payload[1],
        })
    }

    pub fn has_error(&self) -> bool {
        self.info & HEADER_ERR != 0
    }

    pub fn end_of_frame(&self) -> bool {
        self.info & HEADER_EOF != 0
    }

    pub fn frame_id(&self) -> bool {
        self.info & HEADER_FID != 0
    }

    /// Presentation timestamp, when flagged and present
    pub fn pts(&self, payload: &[u8]) -> Option<u32> {
        if self.info & HEADER_PTS == 0 || self.length < 6 {
            return None;
        }
        payload.get(2..6).map(LittleEndian::read_u32)
    }

    /// Source clock reference (STC, SOF counter), when flagged and present
    pub fn scr(&self, payload: &[u8]) -> Option<(u32, u16)> {
        if self.info & HEADER_SCR == 0 {
            return None;
        }
        let offset = if self.info & HEADER_PTS != 0 { 6 } else { 2 };
        if self.length < offset + 6 {
            return None;
        }
        let stc = payload.get(offset..offset + 4).map(LittleEndian::read_u32)?;
        let sof = payload
            .get(offset + 4..offset + 6)
            .map(LittleEndian::read_u16)?;
        Some((stc, sof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_header() {
        let mut payload = vec![12, HEADER_EOH | HEADER_PTS | HEADER_SCR | HEADER_EOF | HEADER_FID];
        payload.extend_from_slice(&0x1122_3344u32.to_le_bytes());
        payload.extend_from_slice(&0x5566_7788u32.to_le_bytes());
        payload.extend_from_slice(&0x0102u16.to_le_bytes());
        payload.extend_from_slice(&[0xaa, 0xbb]);

        let header = PayloadHeader::parse(&payload).unwrap();
        assert_eq!(header.length, 12);
        assert!(header.end_of_frame());
        assert!(header.frame_id());
        assert!(!header.has_error());
        assert_eq!(header.pts(&payload), Some(0x1122_3344));
        assert_eq!(header.scr(&payload), Some((0x5566_7788, 0x0102)));
    }

    #[test]
    fn test_error_bit() {
        let header = PayloadHeader::parse(&[2, HEADER_ERR | HEADER_EOH]).unwrap();
        assert!(header.has_error());
        assert_eq!(header.pts(&[2, HEADER_ERR]), None);
    }

    #[test]
    fn test_header_longer_than_payload() {
        assert_eq!(
            PayloadHeader::parse(&[12, 0x80, 0, 0]),
            Err(ProtocolError::InvalidHeaderLength {
                header: 12,
                payload: 4
            })
        );
        assert!(PayloadHeader::parse(&[1, 0x80]).is_err());
        assert!(PayloadHeader::parse(&[2]).is_err());
    }
}
