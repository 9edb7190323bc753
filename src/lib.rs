pub mod camera;
pub mod capture;
pub mod device;
#[cfg(feature = "display")]
pub mod display;
pub mod error;
pub mod pipeline;
pub mod settings;
pub mod utils;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureOptions;
use crate::device::sim::{SimCameraSpec, SimSystem};
use crate::device::v4l2::V4l2System;
use crate::device::{CameraSystem, SystemRegistry};

pub use camera::CameraFacade;
pub use error::{CameraError, Result};

/// Which camera system backs the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Simulated,
    V4l2,
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub pipeline: PipelineConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub backend: Backend,
    pub retry_interval_ms: u64,
    pub acquire_timeout_ms: u64,
    /// CPU core for the capture thread
    pub capture_core: Option<usize>,
    /// Persisted camera settings (TOML)
    pub settings_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Slots per frame buffer, 1..=4
    pub buffer_capacity: usize,
    /// How long a display read waits for the next frame
    pub frame_wait_ms: u64,
    pub fps_window: usize,
    pub idle_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Simulated,
            retry_interval_ms: 2000,
            acquire_timeout_ms: 1000,
            capture_core: None,
            settings_path: PathBuf::from("argus-settings.toml"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 2,
            frame_wait_ms: 100,
            fps_window: 30,
            idle_backoff_ms: 100,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            title: "Argus".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "argus=info".into(),
        }
    }
}

impl Config {
    /// Defaults, then `path` (or `argus.toml` if present), then
    /// `ARGUS__SECTION__KEY` environment variables
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("argus").required(false),
        };
        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.pipeline
            .buffer_capacity
            .clamp(1, pipeline::MAX_CAPACITY)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.camera.retry_interval_ms)
    }

    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.pipeline.frame_wait_ms)
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            acquire_timeout: Duration::from_millis(self.camera.acquire_timeout_ms),
            idle_backoff: Duration::from_millis(self.pipeline.idle_backoff_ms),
            fps_window: self.pipeline.fps_window,
            core: self.camera.capture_core,
        }
    }
}

/// Registry over the configured backend. The simulated backend exposes one
/// camera producing frames at roughly 30 fps.
pub fn build_registry(backend: Backend) -> Arc<SystemRegistry> {
    match backend {
        Backend::Simulated => SystemRegistry::new(Box::new(|| {
            let mut spec = SimCameraSpec::new("SIM-0001");
            spec.frame_interval = Duration::from_millis(33);
            let (system, _probe) = SimSystem::with_camera(spec);
            Ok(Arc::new(system) as Arc<dyn CameraSystem>)
        })),
        Backend::V4l2 => SystemRegistry::new(Box::new(|| {
            Ok(Arc::new(V4l2System::new()) as Arc<dyn CameraSystem>)
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("argus.toml");
        std::fs::write(
            &path,
            "[camera]\nbackend = \"v4l2\"\n\n[pipeline]\nbuffer_capacity = 9\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.camera.backend, Backend::V4l2);
        assert_eq!(config.camera.retry_interval_ms, 2000);
        assert_eq!(config.buffer_capacity(), pipeline::MAX_CAPACITY);
        assert_eq!(config.logging.filter, "argus=info");
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
