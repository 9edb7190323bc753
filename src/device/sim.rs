//! Simulated camera backend.
//!
//! Behaves like a GenICam camera as far as the pipeline can tell: node
//! values are clamped to their ranges, binning and pixel format refuse
//! writes while streaming, one handle per camera may be open at a time, and
//! acquisition outcomes can be scripted. A [`SimProbe`] lets tests (and the
//! demo) observe and disturb the camera from outside.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    AcquireOutcome, CameraDevice, CameraSystem, DeviceDescriptor, LogDispatch, SdkLogHandler,
    SdkLogLevel, BALANCE_RATIO, BINNING_HORIZONTAL, BINNING_VERTICAL, EXPOSURE_TIME, PIXEL_FORMAT,
    THROUGHPUT_LIMIT,
};
use crate::capture::{Frame, FrameMetadata, PixelFormat};
use crate::error::{CameraError, Result};

/// Static description of a simulated camera
#[derive(Debug, Clone)]
pub struct SimCameraSpec {
    pub serial: String,
    pub model: String,
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub pixel_format: PixelFormat,
    /// Time one acquisition takes
    pub frame_interval: Duration,
    /// Number of `init` calls that fail before one succeeds
    pub init_failures: u32,
    pub max_binning: i64,
    pub exposure_range: (f64, f64),
    pub balance_range: (f64, f64),
    pub throughput_range: (i64, i64),
}

impl SimCameraSpec {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            model: "Simulated Blackfly".into(),
            sensor_width: 640,
            sensor_height: 480,
            pixel_format: PixelFormat::Mono8,
            frame_interval: Duration::ZERO,
            init_failures: 0,
            max_binning: 4,
            exposure_range: (10.0, 30_000_000.0),
            balance_range: (0.25, 4.0),
            throughput_range: (1_000_000, 125_000_000),
        }
    }
}

/// Scripted result of one `next_image` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOutcome {
    Complete,
    Incomplete,
    Timeout,
    /// Transport error from the driver
    Error,
}

/// Calls the pipeline made into a simulated camera
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimCounters {
    pub init_attempts: usize,
    pub deinits: usize,
    pub begin_acquisitions: usize,
    pub end_acquisitions: usize,
    pub frames_delivered: usize,
    /// `(node, value)` for every accepted write
    pub node_writes: Vec<(String, String)>,
}

struct Nodes {
    binning_horizontal: i64,
    binning_vertical: i64,
    exposure: f64,
    balance_ratio: f64,
    throughput: i64,
    pixel_format: PixelFormat,
}

struct CameraInner {
    nodes: Nodes,
    initialized: bool,
    streaming: bool,
    valid: bool,
    open: bool,
    init_failures_left: u32,
    script: VecDeque<SimOutcome>,
    rejected_nodes: Vec<String>,
    sequence: u64,
    counters: SimCounters,
}

struct CameraState {
    spec: SimCameraSpec,
    inner: Mutex<CameraInner>,
}

impl Nodes {
    fn factory(spec: &SimCameraSpec) -> Self {
        Self {
            binning_horizontal: 1,
            binning_vertical: 1,
            exposure: 1000.0,
            balance_ratio: 1.0,
            throughput: spec.throughput_range.1,
            pixel_format: spec.pixel_format,
        }
    }
}

impl CameraState {
    fn new(spec: SimCameraSpec) -> Self {
        let nodes = Nodes::factory(&spec);
        let init_failures_left = spec.init_failures;
        Self {
            spec,
            inner: Mutex::new(CameraInner {
                nodes,
                initialized: false,
                streaming: false,
                valid: true,
                open: false,
                init_failures_left,
                script: VecDeque::new(),
                rejected_nodes: Vec::new(),
                sequence: 0,
                counters: SimCounters::default(),
            }),
        }
    }
}

/// Outside view onto one simulated camera
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<CameraState>,
}

impl SimProbe {
    pub fn serial(&self) -> &str {
        &self.state.spec.serial
    }

    pub fn counters(&self) -> SimCounters {
        self.state.inner.lock().counters.clone()
    }

    /// Outcomes for upcoming acquisitions; `Complete` once exhausted
    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = SimOutcome>) {
        self.state.inner.lock().script.extend(outcomes);
    }

    pub fn set_init_failures(&self, count: u32) {
        self.state.inner.lock().init_failures_left = count;
    }

    /// Makes every later write to `node` fail
    pub fn reject_writes(&self, node: &str) {
        self.state.inner.lock().rejected_nodes.push(node.to_string());
    }

    pub fn accept_writes(&self) {
        self.state.inner.lock().rejected_nodes.clear();
    }

    /// Emulates a camera reset: uninitialized, factory node values
    pub fn power_cycle(&self) {
        let mut inner = self.state.inner.lock();
        inner.nodes = Nodes::factory(&self.state.spec);
        inner.initialized = false;
        inner.streaming = false;
    }

    /// Emulates a camera that vanished without a clean disconnect
    pub fn invalidate(&self) {
        self.state.inner.lock().valid = false;
    }

    /// Emulates auto exposure moving the live value
    pub fn drift_exposure(&self, value: f64) {
        self.state.inner.lock().nodes.exposure = value;
    }

    /// Emulates auto white balance moving the live value
    pub fn drift_balance_ratio(&self, value: f64) {
        self.state.inner.lock().nodes.balance_ratio = value;
    }

    pub fn binning(&self) -> (i64, i64) {
        let inner = self.state.inner.lock();
        (inner.nodes.binning_horizontal, inner.nodes.binning_vertical)
    }

    pub fn exposure(&self) -> f64 {
        self.state.inner.lock().nodes.exposure
    }

    pub fn balance_ratio(&self) -> f64 {
        self.state.inner.lock().nodes.balance_ratio
    }

    pub fn throughput(&self) -> i64 {
        self.state.inner.lock().nodes.throughput
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.state.inner.lock().nodes.pixel_format
    }

    pub fn is_initialized(&self) -> bool {
        self.state.inner.lock().initialized
    }

    pub fn is_streaming(&self) -> bool {
        self.state.inner.lock().streaming
    }

    pub fn is_open(&self) -> bool {
        self.state.inner.lock().open
    }
}

#[derive(Default)]
struct SystemInner {
    cameras: Mutex<Vec<Arc<CameraState>>>,
    log: LogDispatch,
    shutdowns: AtomicUsize,
    enumerations: AtomicUsize,
}

/// Simulated camera system holding any number of plugged cameras
#[derive(Clone, Default)]
pub struct SimSystem {
    inner: Arc<SystemInner>,
}

impl SimSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(spec: SimCameraSpec) -> (Self, SimProbe) {
        let system = Self::new();
        let probe = system.plug(spec);
        (system, probe)
    }

    pub fn plug(&self, spec: SimCameraSpec) -> SimProbe {
        let state = Arc::new(CameraState::new(spec));
        self.inner.cameras.lock().push(Arc::clone(&state));
        SimProbe { state }
    }

    /// Removes the camera from enumeration and invalidates open handles
    pub fn unplug(&self, serial: &str) {
        self.inner.cameras.lock().retain(|camera| {
            if camera.spec.serial == serial {
                camera.inner.lock().valid = false;
                false
            } else {
                true
            }
        });
    }

    pub fn log_level(&self) -> SdkLogLevel {
        self.inner.log.level()
    }

    pub fn has_log_handler(&self) -> bool {
        self.inner.log.has_handler()
    }

    pub fn shutdown_count(&self) -> usize {
        self.inner.shutdowns.load(Ordering::SeqCst)
    }

    pub fn enumerate_count(&self) -> usize {
        self.inner.enumerations.load(Ordering::SeqCst)
    }

    fn emit(&self, level: SdkLogLevel, message: String) {
        self.inner.log.emit(level, "sim", message);
    }
}

impl CameraSystem for SimSystem {
    fn library_version(&self) -> String {
        format!("sim {}", env!("CARGO_PKG_VERSION"))
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        self.inner.enumerations.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner
            .cameras
            .lock()
            .iter()
            .enumerate()
            .map(|(index, camera)| descriptor(&camera.spec, index))
            .collect())
    }

    fn open(&self, index: usize) -> Result<Box<dyn CameraDevice>> {
        let state = self
            .inner
            .cameras
            .lock()
            .get(index)
            .cloned()
            .ok_or(CameraError::NoDevice)?;
        {
            let mut inner = state.inner.lock();
            if inner.open {
                return Err(CameraError::Busy {
                    serial: state.spec.serial.clone(),
                });
            }
            inner.open = true;
        }
        self.emit(
            SdkLogLevel::Info,
            format!("opened camera {}", state.spec.serial),
        );
        Ok(Box::new(SimCamera {
            descriptor: descriptor(&state.spec, index),
            state,
            system: self.clone(),
        }))
    }

    fn set_log_level(&self, level: SdkLogLevel) {
        self.inner.log.set_level(level);
    }

    fn register_log_handler(&self, handler: SdkLogHandler) {
        self.inner.log.set_handler(Some(handler));
    }

    fn unregister_log_handler(&self) {
        self.inner.log.set_handler(None);
    }

    fn shutdown(&self) {
        self.inner.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

fn descriptor(spec: &SimCameraSpec, index: usize) -> DeviceDescriptor {
    DeviceDescriptor {
        serial: spec.serial.clone(),
        model: spec.model.clone(),
        index,
    }
}

/// Open handle onto a simulated camera
pub struct SimCamera {
    descriptor: DeviceDescriptor,
    state: Arc<CameraState>,
    system: SimSystem,
}

impl SimCamera {
    fn ready(&self) -> Result<parking_lot::MutexGuard<'_, CameraInner>> {
        let inner = self.state.inner.lock();
        if !inner.valid {
            return Err(CameraError::InvalidHandle);
        }
        if !inner.initialized {
            return Err(CameraError::NotInitialized);
        }
        Ok(inner)
    }

    fn locked_while_streaming(inner: &CameraInner, name: &str) -> Result<()> {
        if inner.streaming {
            return Err(CameraError::ParameterRejected {
                name: name.into(),
                reason: "not writable while streaming".into(),
            });
        }
        Ok(())
    }

    fn check_writable(inner: &CameraInner, name: &str) -> Result<()> {
        if inner.rejected_nodes.iter().any(|n| n == name) {
            return Err(CameraError::ParameterRejected {
                name: name.into(),
                reason: "write refused".into(),
            });
        }
        Ok(())
    }

    fn frame(&self, inner: &CameraInner) -> Frame {
        let spec = &self.state.spec;
        let nodes = &inner.nodes;
        let width = spec.sensor_width / nodes.binning_horizontal.max(1) as u32;
        let height = spec.sensor_height / nodes.binning_vertical.max(1) as u32;
        let bpp = nodes.pixel_format.bytes_per_pixel().unwrap_or(1);
        let len = (width * height * bpp) as usize;
        let seq = inner.sequence;
        let data: Vec<u8> = (0..len).map(|i| (i as u64).wrapping_add(seq) as u8).collect();

        Frame::new(
            Bytes::from(data),
            FrameMetadata {
                sequence: seq,
                width,
                height,
                stride: width * bpp,
                format: nodes.pixel_format,
                device_timestamp: Some(spec.frame_interval * seq as u32),
            },
        )
    }
}

impl Drop for SimCamera {
    fn drop(&mut self) {
        let mut inner = self.state.inner.lock();
        inner.open = false;
        inner.streaming = false;
    }
}

impl CameraDevice for SimCamera {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn init(&mut self) -> Result<()> {
        let mut inner = self.state.inner.lock();
        inner.counters.init_attempts += 1;
        if !inner.valid {
            return Err(CameraError::InvalidHandle);
        }
        if inner.init_failures_left > 0 {
            inner.init_failures_left -= 1;
            drop(inner);
            self.system
                .emit(SdkLogLevel::Error, "device did not answer".into());
            return Err(CameraError::Init("device did not answer".into()));
        }
        inner.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        let mut inner = self.state.inner.lock();
        inner.counters.deinits += 1;
        inner.streaming = false;
        inner.initialized = false;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.state.inner.lock().initialized
    }

    fn is_valid(&self) -> bool {
        self.state.inner.lock().valid
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        let mut inner = self.ready()?;
        inner.counters.begin_acquisitions += 1;
        inner.streaming = true;
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<()> {
        let mut inner = self.state.inner.lock();
        inner.counters.end_acquisitions += 1;
        inner.streaming = false;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.state.inner.lock().streaming
    }

    fn next_image(&mut self, timeout: Duration) -> Result<AcquireOutcome> {
        let outcome = {
            let mut inner = self.ready()?;
            if !inner.streaming {
                return Err(CameraError::Acquisition("camera is not streaming".into()));
            }
            inner.sequence += 1;
            inner.script.pop_front().unwrap_or(SimOutcome::Complete)
        };
        if outcome == SimOutcome::Error {
            return Err(CameraError::Acquisition("simulated transfer error".into()));
        }

        let interval = self.state.spec.frame_interval;
        if outcome == SimOutcome::Timeout || interval > timeout {
            thread::sleep(timeout);
            return Ok(AcquireOutcome::Timeout);
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }

        match outcome {
            SimOutcome::Incomplete => Ok(AcquireOutcome::Incomplete {
                status: "simulated packet loss".into(),
            }),
            _ => {
                let mut inner = self.state.inner.lock();
                inner.counters.frames_delivered += 1;
                Ok(AcquireOutcome::Complete(self.frame(&inner)))
            }
        }
    }

    fn int_node(&self, name: &str) -> Result<i64> {
        let inner = self.ready()?;
        match name {
            BINNING_HORIZONTAL => Ok(inner.nodes.binning_horizontal),
            BINNING_VERTICAL => Ok(inner.nodes.binning_vertical),
            THROUGHPUT_LIMIT => Ok(inner.nodes.throughput),
            _ => Err(CameraError::ParameterUnavailable(name.into())),
        }
    }

    fn set_int_node(&mut self, name: &str, value: i64) -> Result<i64> {
        let mut inner = self.ready()?;
        Self::check_writable(&inner, name)?;
        let spec = &self.state.spec;
        let applied = match name {
            BINNING_HORIZONTAL | BINNING_VERTICAL => {
                Self::locked_while_streaming(&inner, name)?;
                let applied = value.clamp(1, spec.max_binning);
                if name == BINNING_HORIZONTAL {
                    inner.nodes.binning_horizontal = applied;
                } else {
                    inner.nodes.binning_vertical = applied;
                }
                applied
            }
            THROUGHPUT_LIMIT => {
                let (min, max) = spec.throughput_range;
                inner.nodes.throughput = value.clamp(min, max);
                inner.nodes.throughput
            }
            _ => return Err(CameraError::ParameterUnavailable(name.into())),
        };
        inner
            .counters
            .node_writes
            .push((name.to_string(), applied.to_string()));
        Ok(applied)
    }

    fn float_node(&self, name: &str) -> Result<f64> {
        let inner = self.ready()?;
        match name {
            EXPOSURE_TIME => Ok(inner.nodes.exposure),
            BALANCE_RATIO => Ok(inner.nodes.balance_ratio),
            _ => Err(CameraError::ParameterUnavailable(name.into())),
        }
    }

    fn set_float_node(&mut self, name: &str, value: f64) -> Result<f64> {
        let mut inner = self.ready()?;
        Self::check_writable(&inner, name)?;
        let spec = &self.state.spec;
        let applied = match name {
            EXPOSURE_TIME => {
                inner.nodes.exposure = value.clamp(spec.exposure_range.0, spec.exposure_range.1);
                inner.nodes.exposure
            }
            BALANCE_RATIO => {
                inner.nodes.balance_ratio =
                    value.clamp(spec.balance_range.0, spec.balance_range.1);
                inner.nodes.balance_ratio
            }
            _ => return Err(CameraError::ParameterUnavailable(name.into())),
        };
        inner
            .counters
            .node_writes
            .push((name.to_string(), applied.to_string()));
        Ok(applied)
    }

    fn enum_node(&self, name: &str) -> Result<String> {
        let inner = self.ready()?;
        match name {
            PIXEL_FORMAT => Ok(inner.nodes.pixel_format.node_name().to_string()),
            _ => Err(CameraError::ParameterUnavailable(name.into())),
        }
    }

    fn set_enum_node(&mut self, name: &str, entry: &str) -> Result<String> {
        let mut inner = self.ready()?;
        if name != PIXEL_FORMAT {
            return Err(CameraError::ParameterUnavailable(name.into()));
        }
        Self::locked_while_streaming(&inner, name)?;
        let format = PixelFormat::from_node_name(entry)
            .filter(|f| f.bytes_per_pixel().is_some())
            .ok_or_else(|| CameraError::ParameterRejected {
                name: name.into(),
                reason: format!("unsupported entry {}", entry),
            })?;
        inner.nodes.pixel_format = format;
        inner
            .counters
            .node_writes
            .push((name.to_string(), entry.to_string()));
        Ok(format.node_name().to_string())
    }
}
