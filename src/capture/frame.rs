use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data as delivered by the device, never mutated after acquisition
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row for packed formats, 0 for compressed ones
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Rgb8,
    Bgr8,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 5] = [
        PixelFormat::Mono8,
        PixelFormat::Rgb8,
        PixelFormat::Bgr8,
        PixelFormat::Yuyv,
        PixelFormat::Mjpeg,
    ];

    /// Entry name of the `PixelFormat` enumeration node
    pub fn node_name(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Rgb8 => "RGB8Packed",
            PixelFormat::Bgr8 => "BGR8Packed",
            PixelFormat::Yuyv => "YUV422Packed",
            PixelFormat::Mjpeg => "JPEG",
        }
    }

    pub fn from_node_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.node_name() == name)
    }

    /// Bytes per pixel of the packed layout, `None` for compressed formats
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Mono8 => Some(1),
            PixelFormat::Yuyv => Some(2),
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => Some(3),
            PixelFormat::Mjpeg => None,
        }
    }

    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|f| *f == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.node_name())
    }
}

/// RGBA8 image ready for texture upload.
///
/// Shares no storage with the [`AnalysisFrame`] built from the same capture;
/// both carry the capture's `sequence` so consumers can check pairing.
#[derive(Clone)]
pub struct DisplayFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA rows
    pub pixels: Bytes,
    pub captured_at: Instant,
}

impl DisplayFrame {
    pub fn pitch(&self) -> usize {
        self.width as usize * 4
    }
}

impl fmt::Debug for DisplayFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayFrame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// CPU pixel matrix: one channel for mono sources, BGR for colour sources
#[derive(Clone)]
pub struct AnalysisFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Bytes,
    pub captured_at: Instant,
}

impl AnalysisFrame {
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let stride = self.stride();
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width {
            return None;
        }
        let channels = self.channels as usize;
        let start = x as usize * channels;
        self.row(y).map(|row| &row[start..start + channels])
    }
}

impl fmt::Debug for AnalysisFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisFrame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_names_round_trip() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_node_name(format.node_name()), Some(format));
        }
        assert_eq!(PixelFormat::from_node_name("BayerRG8"), None);
    }

    #[test]
    fn next_cycles_through_all_formats() {
        let mut format = PixelFormat::Mono8;
        for _ in 0..PixelFormat::ALL.len() {
            format = format.next();
        }
        assert_eq!(format, PixelFormat::Mono8);
    }

    #[test]
    fn analysis_pixel_access() {
        let frame = AnalysisFrame {
            sequence: 1,
            width: 2,
            height: 2,
            channels: 3,
            data: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]),
            captured_at: Instant::now(),
        };
        assert_eq!(frame.pixel(1, 1), Some(&[10u8, 11, 12][..]));
        assert_eq!(frame.row(0), Some(&[1u8, 2, 3, 4, 5, 6][..]));
        assert!(frame.pixel(2, 0).is_none());
        assert!(frame.row(2).is_none());
    }
}
