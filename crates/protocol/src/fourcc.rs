//! Four-character pixel format codes
//!
//! Formats are identified by the first four bytes of the format GUID read as
//! big-endian ASCII. A handful of vendor and legacy codes are substituted with
//! the canonical code the rest of the engine expects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Vendor/legacy code to canonical code substitutions, applied once at parse time
pub const FOURCC_REMAP: [(u32, u32); 6] = [
    (0x5938_2020, 0x4752_4559), // 'Y8  ' -> 'GREY'
    (0x5257_3130, 0x7052_4141), // 'RW10' -> 'pRAA'
    (0x3200_0000, 0x4752_4559), // L8 -> 'GREY'
    (0x5000_0000, 0x5a31_3620), // D16 -> 'Z16 '
    (0x5241_5738, 0x4752_4559), // 'RAW8' -> 'GREY'
    (0x5257_3136, 0x4259_5232), // 'RW16' -> 'BYR2'
];

/// A pixel format code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCc(pub u32);

impl FourCc {
    pub const MJPG: FourCc = FourCc(0x4d4a_5047);
    pub const YUYV: FourCc = FourCc(0x5955_5956);
    pub const YUY2: FourCc = FourCc(0x5955_5932);
    pub const UYVY: FourCc = FourCc(0x5559_5659);
    pub const GREY: FourCc = FourCc(0x4752_4559);
    pub const Z16: FourCc = FourCc(0x5a31_3620);
    pub const H264: FourCc = FourCc(0x4832_3634);

    /// Build a code from its four ASCII bytes
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        FourCc(u32::from_be_bytes(bytes))
    }

    /// Read the code from the leading bytes of a format GUID, applying the remap table
    pub fn from_guid(guid: &[u8]) -> Option<Self> {
        let head: [u8; 4] = guid.get(..4)?.try_into().ok()?;
        Some(Self::from_bytes(head).remapped())
    }

    /// Substitute a vendor/legacy code with its canonical equivalent
    pub fn remapped(self) -> Self {
        FOURCC_REMAP
            .iter()
            .find(|(from, _)| *from == self.0)
            .map(|(_, to)| FourCc(*to))
            .unwrap_or(self)
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            let text: String = bytes.iter().map(|b| *b as char).collect();
            write!(f, "{}", text.trim_end())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u32::from_str_radix(hex, 16)
                .map(FourCc)
                .map_err(|_| format!("Invalid fourcc hex value: {}", s));
        }
        if s.is_empty() || s.len() > 4 || !s.is_ascii() {
            return Err(format!("Invalid fourcc '{}', expected 1-4 ASCII characters", s));
        }
        let mut bytes = [b' '; 4];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self::from_bytes(bytes))
    }
}

impl TryFrom<String> for FourCc {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FourCc> for String {
    fn from(value: FourCc) -> Self {
        value.to_string()
    }
}
