//! Public camera object for the presentation layer

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::capture::{AnalysisFrame, CaptureLoop, CaptureOptions, CaptureShared, DisplayFrame};
use crate::device::{DeviceLifecycleManager, SystemRegistry};
use crate::pipeline::{frame_buffer, FrameConsumer};
use crate::settings::{SettingsHandle, SettingsReconciler, SettingsStore};
use crate::utils::{overlay_line, CameraStatus};
use crate::Config;

struct Running {
    handle: JoinHandle<DeviceLifecycleManager>,
    display: FrameConsumer<DisplayFrame>,
    analysis: FrameConsumer<AnalysisFrame>,
}

/// Owns one camera's pipeline.
///
/// Nothing touches hardware until the first [`CameraFacade::latest_display_frame`]
/// call. The capture thread only starts once a camera initialized.
pub struct CameraFacade {
    registry: Arc<SystemRegistry>,
    settings: SettingsHandle,
    store: Arc<dyn SettingsStore>,
    retry_interval: Duration,
    frame_wait: Duration,
    capacity: usize,
    capture: CaptureOptions,
    shared: Arc<CaptureShared>,
    pending: Option<DeviceLifecycleManager>,
    running: Option<Running>,
    latest_analysis: Option<AnalysisFrame>,
    stopped: bool,
}

impl CameraFacade {
    pub fn new(
        config: &Config,
        registry: Arc<SystemRegistry>,
        settings: SettingsHandle,
        store: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            registry,
            settings,
            store,
            retry_interval: config.retry_interval(),
            frame_wait: config.frame_wait(),
            capacity: config.buffer_capacity(),
            capture: config.capture_options(),
            shared: CaptureShared::new(),
            pending: None,
            running: None,
            latest_analysis: None,
            stopped: false,
        }
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SettingsStore> {
        &self.store
    }

    /// Next display frame. Before the capture thread runs this attempts
    /// initialization (at most once per retry interval) and returns `None`;
    /// afterwards it waits up to the frame wait for the capture thread.
    pub fn latest_display_frame(&mut self) -> Option<DisplayFrame> {
        if self.stopped {
            return None;
        }
        if self.running.is_none() && !self.start() {
            return None;
        }
        let running = self.running.as_ref()?;

        Self::drain_analysis(running, &mut self.latest_analysis);
        let frame = running.display.take(self.frame_wait);
        Self::drain_analysis(running, &mut self.latest_analysis);

        if running.handle.is_finished() && !self.shared.quit_requested() {
            warn!("Capture thread exited unexpectedly");
            self.stop_thread();
        }
        frame
    }

    /// Most recent analysis frame, without waiting
    pub fn latest_analysis_frame(&mut self) -> Option<AnalysisFrame> {
        if let Some(running) = self.running.as_ref() {
            Self::drain_analysis(running, &mut self.latest_analysis);
        }
        self.latest_analysis.clone()
    }

    /// Keeps the analysis buffer from throttling the producer when nobody
    /// reads analysis frames
    fn drain_analysis(running: &Running, latest: &mut Option<AnalysisFrame>) {
        if let Some(frame) = running.analysis.take_latest() {
            *latest = Some(frame);
        }
    }

    /// Brings the camera up on the calling thread, then moves the manager
    /// into the capture thread. The device handle has one owner at any time:
    /// this facade until the spawn, the capture thread until it is joined.
    #[instrument(skip(self), level = "debug")]
    fn start(&mut self) -> bool {
        let manager = self.pending.get_or_insert_with(|| {
            let level = self.settings.get().log_level;
            DeviceLifecycleManager::new(Arc::clone(&self.registry), self.retry_interval)
                .with_log_level(level)
        });

        let initialized = manager.check_initialized();
        self.shared.publish_status(manager.status());
        self.shared.publish_descriptor(manager.descriptor());
        if !initialized {
            return false;
        }
        manager.print_info();

        let Some(manager) = self.pending.take() else {
            return false;
        };
        let (display_tx, display_rx) = frame_buffer(self.capacity);
        let (analysis_tx, analysis_rx) = frame_buffer(self.capacity);
        let reconciler = SettingsReconciler::new(self.settings.clone(), Arc::clone(&self.store));
        let capture = CaptureLoop::new(
            manager,
            reconciler,
            display_tx,
            analysis_tx,
            Arc::clone(&self.shared),
            self.capture.clone(),
        );

        match capture.spawn() {
            Ok(handle) => {
                info!(capacity = self.capacity, "Capture thread spawned");
                self.running = Some(Running {
                    handle,
                    display: display_rx,
                    analysis: analysis_rx,
                });
                true
            }
            Err(e) => {
                error!("Unable to spawn capture thread: {}", e);
                false
            }
        }
    }

    pub fn fps(&self) -> f32 {
        self.shared.telemetry.fps()
    }

    /// Dropped frames in the current one-second window
    pub fn dropped_frames(&self) -> u64 {
        self.shared.telemetry.dropped_frames()
    }

    /// Dropped frames since the capture thread started
    pub fn dropped_total(&self) -> u64 {
        self.shared.telemetry.dropped_total()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.is_streaming()
    }

    /// Whether the capture thread has been started
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn serial_number(&self) -> Option<String> {
        self.shared.descriptor().map(|d| d.serial.clone())
    }

    pub fn model(&self) -> Option<String> {
        self.shared.descriptor().map(|d| d.model.clone())
    }

    /// Width and height of the most recent frame
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.shared.resolution()
    }

    pub fn status(&self) -> Arc<CameraStatus> {
        self.shared.status()
    }

    /// Status, fps and dropped count on one line
    pub fn status_line(&self) -> String {
        overlay_line(&self.status(), self.fps(), self.dropped_frames())
    }

    fn stop_thread(&mut self) {
        self.shared.request_quit();
        let Some(running) = self.running.take() else {
            return;
        };
        let Running {
            handle,
            display,
            analysis,
        } = running;
        // A producer parked on a full buffer sees the disconnect at once
        drop(display);
        drop(analysis);
        match handle.join() {
            Ok(mut manager) => manager.shutdown(),
            Err(_) => error!("Capture thread panicked, camera released on unwind"),
        }
    }

    /// Stops the capture thread, releases the camera and, if this was the
    /// last user, the camera system. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Shutting down camera");
        self.stop_thread();
        if let Some(mut manager) = self.pending.take() {
            manager.shutdown();
        }
        self.shared.publish_status(&CameraStatus::Stopped);
    }
}

impl Drop for CameraFacade {
    fn drop(&mut self) {
        self.shutdown();
    }
}
