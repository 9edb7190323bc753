use std::fmt;
use std::time::Duration;

/// Human-readable camera state surfaced to the render collaborator
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CameraStatus {
    #[default]
    Initializing,
    NoCameras,
    InitFailed {
        retry_in: Duration,
    },
    StartFailed,
    Invalid,
    DroppedFrame,
    Capturing {
        model: String,
        width: u32,
        height: u32,
    },
    Stopped,
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraStatus::Initializing => f.write_str("Initializing..."),
            CameraStatus::NoCameras => f.write_str("No cameras found"),
            CameraStatus::InitFailed { retry_in } => write!(
                f,
                "Initializing camera failed, retrying in {} seconds.",
                retry_in.as_secs_f32()
            ),
            CameraStatus::StartFailed => f.write_str("Unable to start camera..."),
            CameraStatus::Invalid => f.write_str("Camera status invalid. Attempting to restart."),
            CameraStatus::DroppedFrame => f.write_str("Dropped frame."),
            CameraStatus::Capturing {
                model,
                width,
                height,
            } => write!(f, "Capturing from {} at {} x {}", model, width, height),
            CameraStatus::Stopped => f.write_str("Camera stopped."),
        }
    }
}

/// One-line overlay text: status, fps and dropped frames
pub fn overlay_line(status: &CameraStatus, fps: f32, dropped: u64) -> String {
    format!("{} | Fps: {}, dropped {}", status, fps.round() as i64, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text() {
        assert_eq!(CameraStatus::NoCameras.to_string(), "No cameras found");
        assert_eq!(
            CameraStatus::InitFailed {
                retry_in: Duration::from_secs(2)
            }
            .to_string(),
            "Initializing camera failed, retrying in 2 seconds."
        );
        let capturing = CameraStatus::Capturing {
            model: "Blackfly S".into(),
            width: 1440,
            height: 1080,
        };
        assert_eq!(capturing.to_string(), "Capturing from Blackfly S at 1440 x 1080");
        assert_eq!(
            overlay_line(&capturing, 29.6, 3),
            "Capturing from Blackfly S at 1440 x 1080 | Fps: 30, dropped 3"
        );
    }
}
