use thiserror::Error;

/// Errors raised by the device layer and the pipeline around it.
///
/// None of these are fatal: the capture thread turns every one of them into a
/// status update, a counter increment or a backoff.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("no cameras found")]
    NoDevice,

    #[error("camera {serial} is already open")]
    Busy { serial: String },

    #[error("camera initialization failed: {0}")]
    Init(String),

    #[error("camera is not initialized")]
    NotInitialized,

    #[error("camera handle is no longer valid")]
    InvalidHandle,

    #[error("acquisition failed: {0}")]
    Acquisition(String),

    #[error("parameter {0} is not available on this device")]
    ParameterUnavailable(String),

    #[error("parameter {name} rejected: {reason}")]
    ParameterRejected { name: String, reason: String },

    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("settings store: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CameraError> = std::result::Result<T, E>;
