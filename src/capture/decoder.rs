//! Conversion of acquired frames into the display and analysis representations

use bytes::{BufMut, BytesMut};
use jpeg_decoder::Decoder;
use tracing::{debug, info};

use super::frame::{AnalysisFrame, DisplayFrame, Frame, PixelFormat};
use crate::error::{CameraError, Result};

/// Decoded pixel layout before it is split into both representations
#[derive(Clone, Copy)]
enum Layout {
    Mono,
    Rgb,
    Bgr,
}

impl Layout {
    fn channels(self) -> usize {
        match self {
            Layout::Mono => 1,
            Layout::Rgb | Layout::Bgr => 3,
        }
    }
}

/// Builds [`DisplayFrame`]/[`AnalysisFrame`] pairs from raw captures.
///
/// Destination storage is kept between calls and only reallocated when the
/// capture dimensions change; a buffer is reclaimed as soon as the consumer
/// has dropped the frames that were cut from it.
pub struct FrameConverter {
    dims: Option<(u32, u32, usize)>,
    display_buf: BytesMut,
    analysis_buf: BytesMut,
    scratch: Vec<u8>,
}

impl Default for FrameConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameConverter {
    pub fn new() -> Self {
        Self {
            dims: None,
            display_buf: BytesMut::new(),
            analysis_buf: BytesMut::new(),
            scratch: Vec::new(),
        }
    }

    /// Current (width, height) of the destination buffers
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dims.map(|(w, h, _)| (w, h))
    }

    pub fn convert(&mut self, frame: &Frame) -> Result<(DisplayFrame, AnalysisFrame)> {
        let meta = &frame.meta;
        let (width, height, layout, stride) = match meta.format {
            PixelFormat::Mono8 => (meta.width, meta.height, Layout::Mono, None),
            PixelFormat::Rgb8 => (meta.width, meta.height, Layout::Rgb, None),
            PixelFormat::Bgr8 => (meta.width, meta.height, Layout::Bgr, None),
            PixelFormat::Yuyv => {
                let stride = row_stride(meta.stride, meta.width, 2);
                check_len(&frame.data, stride, meta.height, meta.width as usize * 2)?;
                yuyv_to_rgb(&frame.data, meta.width, meta.height, stride, &mut self.scratch);
                (meta.width, meta.height, Layout::Rgb, Some(meta.width as usize * 3))
            }
            PixelFormat::Mjpeg => {
                let (w, h, layout) = decode_jpeg(&frame.data, &mut self.scratch)?;
                (w, h, layout, Some(w as usize * layout.channels()))
            }
        };

        let channels = layout.channels();
        let (src, stride) = match stride {
            Some(stride) => (&self.scratch[..], stride),
            None => {
                let stride = row_stride(meta.stride, width, channels);
                (&frame.data[..], stride)
            }
        };
        check_len(src, stride, height, width as usize * channels)?;

        if self.dims != Some((width, height, channels)) {
            info!(width, height, channels, "Capture resolution changed");
            let pixels = width as usize * height as usize;
            self.display_buf = BytesMut::with_capacity(pixels * 4);
            self.analysis_buf = BytesMut::with_capacity(pixels * channels);
            self.dims = Some((width, height, channels));
        }

        let pixels = width as usize * height as usize;
        self.display_buf.reserve(pixels * 4);
        self.analysis_buf.reserve(pixels * channels);

        let row_len = width as usize * channels;
        for y in 0..height as usize {
            let row = &src[y * stride..y * stride + row_len];
            match layout {
                Layout::Mono => {
                    self.analysis_buf.put_slice(row);
                    for &v in row {
                        self.display_buf.put_slice(&[v, v, v, 255]);
                    }
                }
                Layout::Rgb => {
                    for px in row.chunks_exact(3) {
                        self.display_buf.put_slice(&[px[0], px[1], px[2], 255]);
                        self.analysis_buf.put_slice(&[px[2], px[1], px[0]]);
                    }
                }
                Layout::Bgr => {
                    self.analysis_buf.put_slice(row);
                    for px in row.chunks_exact(3) {
                        self.display_buf.put_slice(&[px[2], px[1], px[0], 255]);
                    }
                }
            }
        }

        let display = DisplayFrame {
            sequence: meta.sequence,
            width,
            height,
            pixels: self.display_buf.split().freeze(),
            captured_at: frame.timestamp,
        };
        let analysis = AnalysisFrame {
            sequence: meta.sequence,
            width,
            height,
            channels: channels as u8,
            data: self.analysis_buf.split().freeze(),
            captured_at: frame.timestamp,
        };
        Ok((display, analysis))
    }
}

fn row_stride(declared: u32, width: u32, bytes_per_pixel: usize) -> usize {
    let tight = width as usize * bytes_per_pixel;
    (declared as usize).max(tight)
}

fn check_len(data: &[u8], stride: usize, height: u32, row_len: usize) -> Result<()> {
    if height == 0 || row_len == 0 {
        return Err(CameraError::Decode("empty frame".into()));
    }
    let needed = stride * (height as usize - 1) + row_len;
    if data.len() < needed {
        return Err(CameraError::Decode(format!(
            "frame holds {} bytes, {} required",
            data.len(),
            needed
        )));
    }
    Ok(())
}

fn decode_jpeg(data: &[u8], out: &mut Vec<u8>) -> Result<(u32, u32, Layout)> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| CameraError::Decode(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| CameraError::Decode("missing JPEG header".into()))?;

    let layout = match info.pixel_format {
        jpeg_decoder::PixelFormat::L8 => Layout::Mono,
        jpeg_decoder::PixelFormat::RGB24 => Layout::Rgb,
        other => return Err(CameraError::UnsupportedFormat(format!("JPEG {:?}", other))),
    };
    debug!(width = info.width, height = info.height, "Decoded JPEG frame");

    *out = pixels;
    Ok((info.width as u32, info.height as u32, layout))
}

/// BT.601 limited-range YUYV to packed RGB
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32, stride: usize, out: &mut Vec<u8>) {
    out.clear();
    out.reserve(width as usize * height as usize * 3);
    let row_len = width as usize * 2;
    for y in 0..height as usize {
        let row = &data[y * stride..y * stride + row_len];
        for quad in row.chunks_exact(4) {
            let u = quad[1] as i32 - 128;
            let v = quad[3] as i32 - 128;
            for luma in [quad[0], quad[2]] {
                let c = 298 * (luma as i32 - 16);
                out.push(clamp_u8((c + 409 * v + 128) >> 8));
                out.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
                out.push(clamp_u8((c + 516 * u + 128) >> 8));
            }
        }
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
