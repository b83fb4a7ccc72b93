//! Reassembled video frames

use crate::buffers::FrameBuffer;
use protocol::StreamProfile;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

struct FrameData {
    profile: StreamProfile,
    sequence: u64,
    timestamp: SystemTime,
    header_len: usize,
    pts: Option<u32>,
    buffer: FrameBuffer,
}

/// One frame handed to the application
///
/// Cheap to clone. The pooled buffer behind it goes back to the pool when
/// the last clone is dropped.
#[derive(Clone)]
pub struct Frame {
    data: Arc<FrameData>,
}

impl Frame {
    /// Wrap a filled buffer whose first `header_len` bytes are the payload header
    pub(crate) fn new(
        profile: StreamProfile,
        sequence: u64,
        header_len: usize,
        pts: Option<u32>,
        buffer: FrameBuffer,
    ) -> Self {
        Self {
            data: Arc::new(FrameData {
                profile,
                sequence,
                timestamp: SystemTime::now(),
                header_len: header_len.min(buffer.len()),
                pts,
                buffer,
            }),
        }
    }

    pub fn profile(&self) -> &StreamProfile {
        &self.data.profile
    }

    /// Position of this frame in its stream, starting at zero
    pub fn sequence(&self) -> u64 {
        self.data.sequence
    }

    /// Host time the payload completed
    pub fn timestamp(&self) -> SystemTime {
        self.data.timestamp
    }

    /// Presentation timestamp from the payload header, in device clock ticks
    pub fn pts(&self) -> Option<u32> {
        self.data.pts
    }

    pub fn header(&self) -> &[u8] {
        &self.data.buffer.as_slice()[..self.data.header_len]
    }

    pub fn header_len(&self) -> usize {
        self.data.header_len
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data.buffer.as_slice()[self.data.header_len..]
    }

    pub fn pixel_len(&self) -> usize {
        self.data.buffer.len() - self.data.header_len
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("profile", &self.data.profile)
            .field("sequence", &self.data.sequence)
            .field("header_len", &self.data.header_len)
            .field("pixel_len", &self.pixel_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::FramePool;
    use protocol::FourCc;

    #[test]
    fn test_header_and_pixels_split() {
        let pool = FramePool::new(1, 32);
        let mut buffer = pool.acquire().unwrap();
        let mut payload = vec![0u8; 14];
        payload[0] = 12;
        payload[12] = 0xaa;
        payload[13] = 0xbb;
        buffer.fill(&payload);

        let profile = StreamProfile::new(FourCc::YUYV, 1, 1, 30);
        let frame = Frame::new(profile, 7, 12, None, buffer);
        assert_eq!(frame.header_len(), 12);
        assert_eq!(frame.header()[0], 12);
        assert_eq!(frame.pixels(), &[0xaa, 0xbb]);
        assert_eq!(frame.pixel_len(), 2);
        assert_eq!(frame.sequence(), 7);
    }

    #[test]
    fn test_last_clone_returns_buffer() {
        let pool = FramePool::new(1, 8);
        let mut buffer = pool.acquire().unwrap();
        buffer.fill(&[2, 0]);

        let frame = Frame::new(StreamProfile::new(FourCc::MJPG, 1, 1, 5), 0, 2, None, buffer);
        let copy = frame.clone();
        drop(frame);
        assert_eq!(pool.available(), 0);
        drop(copy);
        assert_eq!(pool.available(), 1);
    }
}
