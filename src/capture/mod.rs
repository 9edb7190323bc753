pub mod decoder;
pub mod frame;
pub mod thread;

pub use decoder::FrameConverter;
pub use frame::{AnalysisFrame, DisplayFrame, Frame, FrameMetadata, PixelFormat};
pub use thread::{CaptureLoop, CaptureOptions, CaptureShared, Step};
