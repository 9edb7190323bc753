//! Camera device layer: vendor-neutral traits over a GenICam-style node map,
//! the process-wide system registry and the device lifecycle state machine.

pub mod lifecycle;
pub mod sim;
pub mod system;
pub mod v4l2;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::capture::Frame;
use crate::error::Result;

pub use lifecycle::{DeviceLifecycleManager, DeviceState, DEFAULT_RETRY_INTERVAL};
pub use system::{SystemLease, SystemRegistry};

/// Integer node, read side of binning
pub const BINNING_HORIZONTAL: &str = "BinningHorizontal";
/// Integer node, written together with [`BINNING_HORIZONTAL`]
pub const BINNING_VERTICAL: &str = "BinningVertical";
/// Float node
pub const BALANCE_RATIO: &str = "BalanceRatio";
/// Float node, microseconds
pub const EXPOSURE_TIME: &str = "ExposureTimeAbs";
/// Integer node, bytes per second
pub const THROUGHPUT_LIMIT: &str = "DeviceLinkThroughputLimit";
/// Enumeration node, entries named by [`crate::capture::PixelFormat::node_name`]
pub const PIXEL_FORMAT: &str = "PixelFormat";

/// Identity of an enumerated camera, fixed once assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub serial: String,
    pub model: String,
    pub index: usize,
}

/// Result of one blocking acquire call
#[derive(Debug)]
pub enum AcquireOutcome {
    Complete(Frame),
    /// The device delivered a frame it flagged as incomplete
    Incomplete { status: String },
    Timeout,
}

/// Handle to one physical camera.
///
/// Owned exclusively by the capture thread once streaming starts; nothing
/// here is shared across threads.
pub trait CameraDevice: Send {
    fn descriptor(&self) -> &DeviceDescriptor;

    fn init(&mut self) -> Result<()>;
    fn deinit(&mut self) -> Result<()>;
    fn is_initialized(&self) -> bool;

    /// False once the device went away without a clean disconnect
    fn is_valid(&self) -> bool;

    fn begin_acquisition(&mut self) -> Result<()>;
    fn end_acquisition(&mut self) -> Result<()>;
    fn is_streaming(&self) -> bool;

    fn next_image(&mut self, timeout: Duration) -> Result<AcquireOutcome>;

    fn int_node(&self, name: &str) -> Result<i64>;
    /// Writes the node and returns the value the device actually applied
    fn set_int_node(&mut self, name: &str, value: i64) -> Result<i64>;

    fn float_node(&self, name: &str) -> Result<f64>;
    fn set_float_node(&mut self, name: &str, value: f64) -> Result<f64>;

    fn enum_node(&self, name: &str) -> Result<String>;
    fn set_enum_node(&mut self, name: &str, entry: &str) -> Result<String>;
}

/// Verbosity of the camera SDK's own log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SdkLogLevel {
    Off,
    Fatal,
    Alert,
    Crit,
    Error,
    Warn,
    Notice,
    Info,
    Debug,
    NotSet,
}

impl SdkLogLevel {
    pub const ALL: [SdkLogLevel; 10] = [
        SdkLogLevel::Off,
        SdkLogLevel::Fatal,
        SdkLogLevel::Alert,
        SdkLogLevel::Crit,
        SdkLogLevel::Error,
        SdkLogLevel::Warn,
        SdkLogLevel::Notice,
        SdkLogLevel::Info,
        SdkLogLevel::Debug,
        SdkLogLevel::NotSet,
    ];

    /// Unknown indices map to `Off`
    pub fn from_index(index: i64) -> Self {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or(SdkLogLevel::Off)
    }

    pub fn index(self) -> i64 {
        Self::ALL.iter().position(|l| *l == self).unwrap_or(0) as i64
    }

    pub fn next(self) -> Self {
        Self::from_index((self.index() + 1) % Self::ALL.len() as i64)
    }
}

impl fmt::Display for SdkLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Asynchronous log event raised by the camera SDK
#[derive(Debug, Clone)]
pub struct SdkLogEvent {
    pub level: SdkLogLevel,
    pub category: String,
    pub message: String,
}

pub type SdkLogHandler = Arc<dyn Fn(&SdkLogEvent) + Send + Sync>;

/// Process-wide camera system (device enumeration, SDK logging).
pub trait CameraSystem: Send + Sync {
    fn library_version(&self) -> String;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Opens the camera at `index`; a camera that is already open is busy
    fn open(&self, index: usize) -> Result<Box<dyn CameraDevice>>;

    fn set_log_level(&self, level: SdkLogLevel);
    fn register_log_handler(&self, handler: SdkLogHandler);
    fn unregister_log_handler(&self);

    /// Called once when the last lease is released
    fn shutdown(&self);
}

/// Level filter plus the registered handler for a backend's SDK log events
#[derive(Default)]
pub struct LogDispatch {
    level: Mutex<Option<SdkLogLevel>>,
    handler: Mutex<Option<SdkLogHandler>>,
}

impl LogDispatch {
    pub fn level(&self) -> SdkLogLevel {
        self.level.lock().unwrap_or(SdkLogLevel::Off)
    }

    pub fn set_level(&self, level: SdkLogLevel) {
        *self.level.lock() = Some(level);
    }

    pub fn set_handler(&self, handler: Option<SdkLogHandler>) {
        *self.handler.lock() = handler;
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn emit(&self, level: SdkLogLevel, category: &str, message: String) {
        let configured = self.level();
        if configured == SdkLogLevel::Off || level == SdkLogLevel::Off || level > configured {
            return;
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(&SdkLogEvent {
                level,
                category: category.to_string(),
                message,
            });
        }
    }
}

/// Forwards SDK log events into `tracing`
pub fn tracing_log_handler() -> SdkLogHandler {
    Arc::new(|event: &SdkLogEvent| match event.level {
        SdkLogLevel::Off => {}
        SdkLogLevel::Fatal | SdkLogLevel::Alert | SdkLogLevel::Crit | SdkLogLevel::Error => {
            tracing::error!(category = %event.category, "{}", event.message)
        }
        SdkLogLevel::Warn => tracing::warn!(category = %event.category, "{}", event.message),
        SdkLogLevel::Notice | SdkLogLevel::Info => {
            tracing::info!(category = %event.category, "{}", event.message)
        }
        SdkLogLevel::Debug | SdkLogLevel::NotSet => {
            tracing::debug!(category = %event.category, "{}", event.message)
        }
    })
}
