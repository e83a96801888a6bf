use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Borrowed view of a filled buffer slot.
///
/// The bytes live in device-mapped memory. A descriptor handed to a frame
/// handler is valid for the duration of that call; one returned by
/// `grab_frame` is valid until the next grab, stop or close on the session
/// it borrows. Use [`FrameDescriptor::to_frame`] to keep the data longer.
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor<'a> {
    pub width: u32,
    pub height: u32,
    /// First plane only; valid byte length is `data.len()`.
    pub data: &'a [u8],
    pub sequence: u64,
    pub slot: u32,
    pub device_timestamp: Option<Duration>,
}

impl FrameDescriptor<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy the frame out of the mapped slot.
    pub fn to_frame(&self, format: PixelFormat) -> Frame {
        Frame {
            data: Bytes::copy_from_slice(self.data),
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: self.width,
                height: self.height,
                format,
                device_timestamp: self.device_timestamp,
            }),
            timestamp: Instant::now(),
        }
    }
}

/// Owned frame, detached from the buffer pool
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying again
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// When the copy was taken
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel encodings a session can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
    Yuv420,
}

impl PixelFormat {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Yuyv4 => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Yuv420 => *b"YU12",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        match &code {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"YUYV" => Some(PixelFormat::Yuyv4),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" => Some(PixelFormat::Yuv420),
            _ => None,
        }
    }
}

impl From<PixelFormat> for v4l::FourCC {
    fn from(format: PixelFormat) -> Self {
        v4l::FourCC::new(&format.fourcc())
    }
}

/// What the device actually agreed to, read back after configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    /// Raw fourcc; the device may substitute an encoding we have no name for.
    pub fourcc: [u8; 4],
    pub buffer_count: u32,
}

impl NegotiatedFormat {
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(self.fourcc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_known_formats() {
        for format in [PixelFormat::Mjpeg, PixelFormat::Yuyv4, PixelFormat::Nv12] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(*b"H264"), None);
    }

    #[test]
    fn converts_to_v4l_fourcc() {
        assert_eq!(v4l::FourCC::from(PixelFormat::Mjpeg), v4l::FourCC::new(b"MJPG"));
        assert_eq!(v4l::FourCC::from(PixelFormat::Yuyv4).repr, *b"YUYV");
    }

    #[test]
    fn to_frame_copies_out_of_the_slot() {
        let mut slot = vec![7u8; 16];
        let frame = {
            let desc = FrameDescriptor {
                width: 4,
                height: 2,
                data: &slot[..8],
                sequence: 3,
                slot: 1,
                device_timestamp: None,
            };
            desc.to_frame(PixelFormat::Yuyv4)
        };
        slot.fill(0);

        assert_eq!(&frame.data[..], &[7u8; 8]);
        assert_eq!(frame.meta.sequence, 3);
        assert_eq!(frame.meta.format, PixelFormat::Yuyv4);
    }
}
