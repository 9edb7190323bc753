//! Video4Linux camera backend.
//!
//! Node mapping: binning becomes a resolution divisor applied through the
//! capture format, `PixelFormat` maps onto fourcc codes and `ExposureTimeAbs`
//! onto the absolute exposure control (100 µs units). Balance ratio and link
//! throughput have no V4L2 counterpart and report as unavailable.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};
use v4l::buffer::{Flags as BufferFlags, Type};
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    AcquireOutcome, CameraDevice, CameraSystem, DeviceDescriptor, LogDispatch, SdkLogHandler,
    SdkLogLevel, BINNING_HORIZONTAL, BINNING_VERTICAL, EXPOSURE_TIME, PIXEL_FORMAT,
};
use crate::capture::{Frame, FrameMetadata, PixelFormat};
use crate::error::{CameraError, Result};

/// Highest `/dev/videoN` index probed during enumeration
const MAX_DEVICES: usize = 10;
const BUFFER_COUNT: u32 = 4;
const MAX_BINNING: i64 = 4;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
/// Microseconds per unit of `V4L2_CID_EXPOSURE_ABSOLUTE`
const EXPOSURE_UNIT_US: f64 = 100.0;

fn device_path(index: usize) -> PathBuf {
    PathBuf::from(format!("/dev/video{}", index))
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mono8 => FourCC::new(b"GREY"),
        PixelFormat::Rgb8 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr8 => FourCC::new(b"BGR3"),
        PixelFormat::Yuyv => FourCC::new(b"YUYV"),
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
    }
}

fn from_fourcc(code: FourCC) -> Option<PixelFormat> {
    PixelFormat::ALL.into_iter().find(|f| fourcc(*f) == code)
}

/// Enumerates `/dev/video*` nodes with the capture capability
#[derive(Default)]
pub struct V4l2System {
    log: LogDispatch,
    open: Arc<Mutex<HashSet<usize>>>,
}

impl V4l2System {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CameraSystem for V4l2System {
    fn library_version(&self) -> String {
        "v4l 0.14".into()
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut found = Vec::new();
        for index in 0..MAX_DEVICES {
            let path = device_path(index);
            if !path.exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                debug!("Found capture device: {} - {}", path.display(), caps.card);
                found.push(DeviceDescriptor {
                    serial: caps.bus.clone(),
                    model: caps.card.clone(),
                    index,
                });
            }
        }
        Ok(found)
    }

    fn open(&self, index: usize) -> Result<Box<dyn CameraDevice>> {
        let path = device_path(index);
        let dev = Device::with_path(&path)?;
        let caps = dev.query_caps()?;
        if !self.open.lock().insert(index) {
            return Err(CameraError::Busy { serial: caps.bus });
        }
        self.log.emit(
            SdkLogLevel::Info,
            "v4l2",
            format!("opened {} ({})", path.display(), caps.driver),
        );
        Ok(Box::new(V4l2Camera {
            descriptor: DeviceDescriptor {
                serial: caps.bus,
                model: caps.card,
                index,
            },
            path,
            device: None,
            stream: None,
            native: (0, 0),
            binning: (1, 1),
            width: 0,
            height: 0,
            stride: 0,
            format: PixelFormat::Yuyv,
            sequence: 0,
            open: Arc::clone(&self.open),
        }))
    }

    fn set_log_level(&self, level: SdkLogLevel) {
        self.log.set_level(level);
    }

    fn register_log_handler(&self, handler: SdkLogHandler) {
        self.log.set_handler(Some(handler));
    }

    fn unregister_log_handler(&self) {
        self.log.set_handler(None);
    }

    fn shutdown(&self) {
        debug!("V4L2 system released");
    }
}

/// One opened V4L2 capture node
pub struct V4l2Camera {
    descriptor: DeviceDescriptor,
    path: PathBuf,
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    /// Format size at initialization, divided by the binning factors
    native: (u32, u32),
    binning: (i64, i64),
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    sequence: u64,
    open: Arc<Mutex<HashSet<usize>>>,
}

impl V4l2Camera {
    fn device(&self) -> Result<&Device> {
        self.device.as_ref().ok_or(CameraError::NotInitialized)
    }

    fn ensure_idle(&self, name: &str) -> Result<()> {
        if self.stream.is_some() {
            return Err(CameraError::ParameterRejected {
                name: name.into(),
                reason: "not writable while streaming".into(),
            });
        }
        Ok(())
    }

    /// Re-applies size (from binning) and optionally a new pixel format
    fn apply_format(&mut self, format: Option<PixelFormat>) -> Result<()> {
        let device = self.device()?;
        let mut fmt = device.format()?;
        fmt.width = self.native.0 / self.binning.0 as u32;
        fmt.height = self.native.1 / self.binning.1 as u32;
        if let Some(format) = format {
            fmt.fourcc = fourcc(format);
        }
        let applied = device.set_format(&fmt)?;
        let format = from_fourcc(applied.fourcc)
            .ok_or_else(|| CameraError::UnsupportedFormat(applied.fourcc.to_string()))?;

        self.width = applied.width;
        self.height = applied.height;
        self.stride = applied.stride;
        self.format = format;
        debug!(
            width = applied.width,
            height = applied.height,
            "Capture format set to {}",
            applied.fourcc
        );
        Ok(())
    }

    fn exposure_range(&self) -> Result<(i64, i64)> {
        let controls = self.device()?.query_controls()?;
        controls
            .iter()
            .find(|d| d.id == V4L2_CID_EXPOSURE_ABSOLUTE)
            .map(|d| (d.minimum, d.maximum))
            .ok_or_else(|| CameraError::ParameterUnavailable(EXPOSURE_TIME.into()))
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.stream = None;
        self.open.lock().remove(&self.descriptor.index);
    }
}

impl CameraDevice for V4l2Camera {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn init(&mut self) -> Result<()> {
        let device = Device::with_path(&self.path)?;
        let caps = device.query_caps()?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::Init("device doesn't support video capture".into()));
        }
        let fmt = device.format()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        self.native = (fmt.width, fmt.height);
        self.binning = (1, 1);
        self.device = Some(device);

        // Drivers that default to an exotic fourcc get YUYV, which all UVC cameras offer
        let preferred = from_fourcc(fmt.fourcc).unwrap_or(PixelFormat::Yuyv);
        if let Err(e) = self.apply_format(Some(preferred)) {
            self.device = None;
            return Err(e);
        }
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.stream = None;
        self.device = None;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    fn is_valid(&self) -> bool {
        Path::new(&self.path).exists()
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        let stream = MmapStream::with_buffers(self.device()?, Type::VideoCapture, BUFFER_COUNT)?;
        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", BUFFER_COUNT);
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    fn next_image(&mut self, timeout: Duration) -> Result<AcquireOutcome> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::Acquisition("stream not started".into()))?;
        stream.set_timeout(timeout);

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(AcquireOutcome::Timeout),
            Err(e) => return Err(e.into()),
        };
        if meta.flags.contains(BufferFlags::ERROR) {
            return Ok(AcquireOutcome::Incomplete {
                status: format!("buffer {} flagged as corrupt", meta.sequence),
            });
        }

        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);
        let device_timestamp = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        self.sequence += 1;
        let stride = if self.format == PixelFormat::Mjpeg {
            0
        } else {
            self.stride
        };
        Ok(AcquireOutcome::Complete(Frame::new(
            data,
            FrameMetadata {
                sequence: self.sequence,
                width: self.width,
                height: self.height,
                stride,
                format: self.format,
                device_timestamp: Some(device_timestamp),
            },
        )))
    }

    fn int_node(&self, name: &str) -> Result<i64> {
        self.device()?;
        match name {
            BINNING_HORIZONTAL => Ok(self.binning.0),
            BINNING_VERTICAL => Ok(self.binning.1),
            _ => Err(CameraError::ParameterUnavailable(name.into())),
        }
    }

    fn set_int_node(&mut self, name: &str, value: i64) -> Result<i64> {
        self.device()?;
        let value = value.clamp(1, MAX_BINNING);
        match name {
            BINNING_HORIZONTAL => {
                self.ensure_idle(name)?;
                self.binning.0 = value;
                self.apply_format(None)?;
                Ok(self.binning.0)
            }
            BINNING_VERTICAL => {
                self.ensure_idle(name)?;
                self.binning.1 = value;
                self.apply_format(None)?;
                Ok(self.binning.1)
            }
            _ => Err(CameraError::ParameterUnavailable(name.into())),
        }
    }

    fn float_node(&self, name: &str) -> Result<f64> {
        if name != EXPOSURE_TIME {
            return Err(CameraError::ParameterUnavailable(name.into()));
        }
        match self.device()?.control(V4L2_CID_EXPOSURE_ABSOLUTE)?.value {
            Value::Integer(units) => Ok(units as f64 * EXPOSURE_UNIT_US),
            _ => Err(CameraError::ParameterUnavailable(name.into())),
        }
    }

    fn set_float_node(&mut self, name: &str, value: f64) -> Result<f64> {
        if name != EXPOSURE_TIME {
            return Err(CameraError::ParameterUnavailable(name.into()));
        }
        let (min, max) = self.exposure_range()?;
        let units = ((value / EXPOSURE_UNIT_US).round() as i64).clamp(min, max);
        self.device()?.set_control(Control {
            id: V4L2_CID_EXPOSURE_ABSOLUTE,
            value: Value::Integer(units),
        })?;
        self.float_node(name)
    }

    fn enum_node(&self, name: &str) -> Result<String> {
        self.device()?;
        match name {
            PIXEL_FORMAT => Ok(self.format.node_name().to_string()),
            _ => Err(CameraError::ParameterUnavailable(name.into())),
        }
    }

    fn set_enum_node(&mut self, name: &str, entry: &str) -> Result<String> {
        self.device()?;
        if name != PIXEL_FORMAT {
            return Err(CameraError::ParameterUnavailable(name.into()));
        }
        self.ensure_idle(name)?;
        let format = PixelFormat::from_node_name(entry).ok_or_else(|| {
            CameraError::ParameterRejected {
                name: name.into(),
                reason: format!("unknown entry {}", entry),
            }
        })?;
        self.apply_format(Some(format))?;
        Ok(self.format.node_name().to_string())
    }
}
