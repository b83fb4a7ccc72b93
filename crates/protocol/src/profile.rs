//! Stream profiles
//!
//! A [`StreamProfile`] is the (format, width, height, fps) contract an
//! application asks for. Profiles are derived from the parsed format/frame
//! tables and resolved back to descriptor indices with [`find_profile`].

use crate::constants::INTERVALS_PER_SECOND;
use crate::descriptors::{DeviceDescriptors, FormatDescriptor, FrameDescriptor, StreamingInterface};
use crate::error::ProtocolError;
use crate::fourcc::FourCc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A streaming configuration an application can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamProfile {
    pub format: FourCc,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StreamProfile {
    pub fn new(format: FourCc, width: u32, height: u32, fps: u32) -> Self {
        Self {
            format,
            width,
            height,
            fps,
        }
    }

    /// Nominal frame interval in 100ns units (zero for a zero fps)
    pub fn frame_interval(&self) -> u32 {
        if self.fps == 0 {
            0
        } else {
            INTERVALS_PER_SECOND / self.fps
        }
    }
}

impl fmt::Display for StreamProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}x{}@{}",
            self.format, self.width, self.height, self.fps
        )
    }
}

impl FromStr for StreamProfile {
    type Err = ProtocolError;

    /// Parse `FOURCC:WIDTHxHEIGHT@FPS`, e.g. `YUYV:640x480@30`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidProfile(s.to_string());

        let (format, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (size, fps) = rest.split_once('@').ok_or_else(invalid)?;
        let (width, height) = size.split_once(['x', 'X']).ok_or_else(invalid)?;

        Ok(Self {
            format: format.parse().map_err(|_| invalid())?,
            width: width.trim().parse().map_err(|_| invalid())?,
            height: height.trim().parse().map_err(|_| invalid())?,
            fps: fps.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Descriptor indices resolved for a requested profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileMatch {
    pub profile: StreamProfile,
    pub interface_number: u8,
    pub endpoint_address: u8,
    pub format_index: u8,
    pub frame_index: u8,
    /// Interval in 100ns units whose fps equals the requested fps
    pub frame_interval: u32,
    /// Compressed formats whose payload size varies per frame
    pub variable_size: bool,
    pub max_frame_buffer_size: u32,
}

fn fps_for_interval(interval: u32) -> u32 {
    INTERVALS_PER_SECOND / interval
}

/// (fps, interval) pairs for a frame, deduplicated on fps
fn frame_rates(frame: &FrameDescriptor) -> Vec<(u32, u32)> {
    let mut rates: Vec<(u32, u32)> = Vec::new();
    for interval in frame.intervals.expand() {
        let fps = fps_for_interval(interval);
        if fps != 0 && !rates.iter().any(|(seen, _)| *seen == fps) {
            rates.push((fps, interval));
        }
    }
    rates
}

fn frames(
    streaming: &StreamingInterface,
) -> impl Iterator<Item = (&FormatDescriptor, &FrameDescriptor)> {
    streaming
        .formats
        .iter()
        .flat_map(|format| format.frames.iter().map(move |frame| (format, frame)))
}

/// Every profile the parsed tables support, in descriptor order
///
/// Streaming interfaces without a read endpoint cannot stream and contribute
/// nothing.
pub fn derive_profiles(descriptors: &DeviceDescriptors) -> Vec<StreamProfile> {
    let mut profiles = Vec::new();

    for streaming in descriptors
        .streaming
        .iter()
        .filter(|s| s.endpoint_address.is_some())
    {
        for (format, frame) in frames(streaming) {
            for (fps, _) in frame_rates(frame) {
                let profile = StreamProfile::new(
                    format.fourcc,
                    u32::from(frame.width),
                    u32::from(frame.height),
                    fps,
                );
                if !profiles.contains(&profile) {
                    profiles.push(profile);
                }
            }
        }
    }

    profiles
}

/// Resolve a profile to descriptor indices; exact matches only
pub fn find_profile(descriptors: &DeviceDescriptors, profile: &StreamProfile) -> Option<ProfileMatch> {
    descriptors.streaming.iter().find_map(|streaming| {
        let endpoint_address = streaming.endpoint_address?;
        frames(streaming).find_map(|(format, frame)| {
            if format.fourcc != profile.format
                || u32::from(frame.width) != profile.width
                || u32::from(frame.height) != profile.height
            {
                return None;
            }
            let (_, frame_interval) = frame_rates(frame)
                .into_iter()
                .find(|(fps, _)| *fps == profile.fps)?;

            Some(ProfileMatch {
                profile: *profile,
                interface_number: streaming.interface_number,
                endpoint_address,
                format_index: format.format_index,
                frame_index: frame.frame_index,
                frame_interval,
                variable_size: format.variable_size,
                max_frame_buffer_size: frame.max_frame_buffer_size,
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parse_and_display() {
        let profile: StreamProfile = "YUYV:640x480@30".parse().unwrap();
        assert_eq!(profile, StreamProfile::new(FourCc::YUYV, 640, 480, 30));
        assert_eq!(profile.to_string(), "YUYV:640x480@30");

        let z16: StreamProfile = "Z16:1280X720@90".parse().unwrap();
        assert_eq!(z16.format, FourCc::Z16);
        assert_eq!(z16.height, 720);
    }

    #[test]
    fn test_profile_parse_rejects_garbage() {
        for input in ["", "YUYV", "YUYV:640x480", "YUYV:640@30", "YUYV:axb@30", "TOOLONG:1x1@1"] {
            assert!(
                matches!(input.parse::<StreamProfile>(), Err(ProtocolError::InvalidProfile(_))),
                "{input} should not parse"
            );
        }
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(StreamProfile::new(FourCc::YUYV, 1, 1, 30).frame_interval(), 333_333);
        assert_eq!(StreamProfile::new(FourCc::YUYV, 1, 1, 0).frame_interval(), 0);
    }
}
