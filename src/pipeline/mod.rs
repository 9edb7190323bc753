pub mod buffer;
pub mod telemetry;

pub use buffer::{frame_buffer, FrameConsumer, FrameProducer, PushOutcome, MAX_CAPACITY};
pub use telemetry::{FpsEstimator, Telemetry, DROP_WINDOW};
