//! Capture thread: the only place that touches the camera once it runs.
//!
//! Each iteration brings the device up, reconciles settings, acquires one
//! image, converts it and hands both representations to the consumer.
//! Failures downgrade to a status update and an empty iteration; only the
//! quit flag ends the loop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::atomic::AtomicCell;
use tracing::{debug, info, trace, warn};

use super::{AnalysisFrame, DisplayFrame, FrameConverter};
use crate::device::{AcquireOutcome, DeviceDescriptor, DeviceLifecycleManager};
use crate::pipeline::{FpsEstimator, FrameProducer, PushOutcome, Telemetry};
use crate::settings::SettingsReconciler;
use crate::utils::CameraStatus;

/// State shared between the capture thread and its readers
pub struct CaptureShared {
    quit: AtomicBool,
    streaming: AtomicBool,
    pub telemetry: Telemetry,
    status: ArcSwap<CameraStatus>,
    descriptor: ArcSwapOption<DeviceDescriptor>,
    resolution: AtomicCell<Option<(u32, u32)>>,
}

impl Default for CaptureShared {
    fn default() -> Self {
        Self {
            quit: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            telemetry: Telemetry::new(),
            status: ArcSwap::from_pointee(CameraStatus::Initializing),
            descriptor: ArcSwapOption::empty(),
            resolution: AtomicCell::new(None),
        }
    }
}

impl CaptureShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Arc<CameraStatus> {
        self.status.load_full()
    }

    pub fn publish_status(&self, status: &CameraStatus) {
        if **self.status.load() != *status {
            self.status.store(Arc::new(status.clone()));
        }
    }

    pub fn descriptor(&self) -> Option<Arc<DeviceDescriptor>> {
        self.descriptor.load_full()
    }

    pub fn publish_descriptor(&self, descriptor: Option<&DeviceDescriptor>) {
        let current = self.descriptor.load();
        if current.as_deref() != descriptor {
            self.descriptor.store(descriptor.cloned().map(Arc::new));
        }
    }

    /// Width and height of the last converted frame
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution.load()
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Upper bound on one acquire call, and so on shutdown latency
    pub acquire_timeout: Duration,
    /// Sleep after an iteration that could not reach the streaming state
    pub idle_backoff: Duration,
    /// Frame intervals averaged into the fps estimate
    pub fps_window: usize,
    /// Pin the capture thread to this CPU core
    pub core: Option<usize>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(1000),
            idle_backoff: Duration::from_millis(100),
            fps_window: 30,
            core: None,
        }
    }
}

/// What one iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    NotInitialized,
    NotStreaming,
    Invalid,
    /// Timed out or incomplete; counted as dropped
    Dropped,
    /// Acquire or conversion failed; counted as dropped
    Failed,
    Produced { sequence: u64 },
    /// Quit or a vanished consumer interrupted a push
    Cancelled,
}

pub struct CaptureLoop {
    manager: DeviceLifecycleManager,
    reconciler: SettingsReconciler,
    converter: FrameConverter,
    display: FrameProducer<DisplayFrame>,
    analysis: FrameProducer<AnalysisFrame>,
    shared: Arc<CaptureShared>,
    fps: FpsEstimator,
    options: CaptureOptions,
}

impl CaptureLoop {
    pub fn new(
        manager: DeviceLifecycleManager,
        reconciler: SettingsReconciler,
        display: FrameProducer<DisplayFrame>,
        analysis: FrameProducer<AnalysisFrame>,
        shared: Arc<CaptureShared>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            manager,
            reconciler,
            converter: FrameConverter::new(),
            display,
            analysis,
            shared,
            fps: FpsEstimator::new(options.fps_window),
            options,
        }
    }

    pub fn manager(&self) -> &DeviceLifecycleManager {
        &self.manager
    }

    /// Runs the loop on a named thread. The join handle yields the manager
    /// back so the caller can release the camera.
    pub fn spawn(self) -> io::Result<JoinHandle<DeviceLifecycleManager>> {
        thread::Builder::new()
            .name("argus-capture".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) -> DeviceLifecycleManager {
        if let Some(core) = self.options.core {
            pin_to_core(core);
        }
        info!("Capture thread started");

        while !self.shared.quit_requested() {
            let step = self.step();
            trace!(?step, "Capture iteration");
            if matches!(
                step,
                Step::NotInitialized | Step::NotStreaming | Step::Failed
            ) {
                thread::sleep(self.options.idle_backoff);
            }
        }

        self.shared.streaming.store(false, Ordering::Release);
        info!(
            frames = self.shared.telemetry.frames_total(),
            dropped = self.shared.telemetry.dropped_total(),
            "Capture thread stopped"
        );
        self.manager
    }

    /// One capture iteration
    pub fn step(&mut self) -> Step {
        let step = self.acquire_and_forward();
        self.publish();
        step
    }

    fn publish(&self) {
        self.shared
            .streaming
            .store(self.manager.is_streaming(), Ordering::Release);
        self.shared.publish_status(self.manager.status());
    }

    fn acquire_and_forward(&mut self) -> Step {
        if !self.manager.check_initialized() {
            return Step::NotInitialized;
        }
        self.shared.publish_descriptor(self.manager.descriptor());

        let report = self.reconciler.reconcile(&mut self.manager);
        if report.stopped_stream {
            self.fps.reset();
        }

        if !self.manager.check_streaming() {
            return Step::NotStreaming;
        }

        if !self.manager.check_valid() {
            self.fps.reset();
            return Step::Invalid;
        }

        let Some(device) = self.manager.device_mut() else {
            return Step::NotInitialized;
        };
        let frame = match device.next_image(self.options.acquire_timeout) {
            Ok(AcquireOutcome::Complete(frame)) => frame,
            Ok(AcquireOutcome::Incomplete { status }) => {
                debug!("Image incomplete with image status {}", status);
                self.shared.telemetry.record_dropped();
                self.manager.set_status(CameraStatus::DroppedFrame);
                return Step::Dropped;
            }
            Ok(AcquireOutcome::Timeout) => {
                debug!("Acquisition timed out");
                self.shared.telemetry.record_dropped();
                self.manager.set_status(CameraStatus::DroppedFrame);
                return Step::Dropped;
            }
            Err(e) => {
                warn!("Error acquiring image: {}", e);
                self.shared.telemetry.record_dropped();
                self.manager.set_status(CameraStatus::DroppedFrame);
                return Step::Failed;
            }
        };

        let started = Instant::now();
        let (display, analysis) = match self.converter.convert(&frame) {
            Ok(converted) => converted,
            Err(e) => {
                warn!("Error converting image: {}", e);
                self.shared.telemetry.record_dropped();
                self.manager.set_status(CameraStatus::DroppedFrame);
                return Step::Failed;
            }
        };
        metrics::histogram!("argus_convert_time_us").record(started.elapsed().as_micros() as f64);

        let sequence = display.sequence;
        let (width, height) = (display.width, display.height);
        self.shared.resolution.store(Some((width, height)));
        if let Some(descriptor) = self.manager.descriptor() {
            let model = descriptor.model.clone();
            self.manager.set_status(CameraStatus::Capturing {
                model,
                width,
                height,
            });
        }
        // Readers must not see a frame before the status describing it
        self.publish();

        // Analysis first, so a reader woken by the display frame finds its pair
        let outcome = match self.analysis.push(analysis, &self.shared.quit) {
            PushOutcome::Pushed => self.display.push(display, &self.shared.quit),
            interrupted => interrupted,
        };
        if outcome != PushOutcome::Pushed {
            debug!(?outcome, "Frame hand-off interrupted");
            return Step::Cancelled;
        }

        self.shared.telemetry.record_frame();
        if let Some(fps) = self.fps.tick(frame.timestamp) {
            self.shared.telemetry.set_fps(fps);
        }
        Step::Produced { sequence }
    }
}

fn pin_to_core(core: usize) {
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!("Unable to list CPU cores, capture thread not pinned");
        return;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            debug!(core, "Capture thread pinned");
        }
        _ => warn!(core, "Unable to pin capture thread"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimCameraSpec, SimOutcome, SimProbe, SimSystem};
    use crate::device::{CameraSystem, SystemRegistry, DEFAULT_RETRY_INTERVAL};
    use crate::pipeline::{frame_buffer, FrameConsumer};
    use crate::settings::{MemorySettingsStore, SettingsHandle};

    struct Rig {
        capture: CaptureLoop,
        display: FrameConsumer<DisplayFrame>,
        analysis: FrameConsumer<AnalysisFrame>,
        shared: Arc<CaptureShared>,
        settings: SettingsHandle,
        probe: SimProbe,
    }

    fn rig(capacity: usize) -> Rig {
        let (system, probe) = SimSystem::with_camera(SimCameraSpec::new("SIM-T"));
        let registry = SystemRegistry::new(Box::new(move || {
            Ok(Arc::new(system.clone()) as Arc<dyn CameraSystem>)
        }));
        let manager = DeviceLifecycleManager::new(registry, DEFAULT_RETRY_INTERVAL);
        let settings = SettingsHandle::default();
        let reconciler =
            SettingsReconciler::new(settings.clone(), Arc::new(MemorySettingsStore::new()));
        let (display_tx, display) = frame_buffer(capacity);
        let (analysis_tx, analysis) = frame_buffer(capacity);
        let shared = CaptureShared::new();
        let options = CaptureOptions {
            acquire_timeout: Duration::from_millis(20),
            idle_backoff: Duration::from_millis(5),
            ..CaptureOptions::default()
        };
        let capture = CaptureLoop::new(
            manager,
            reconciler,
            display_tx,
            analysis_tx,
            Arc::clone(&shared),
            options,
        );
        Rig {
            capture,
            display,
            analysis,
            shared,
            settings,
            probe,
        }
    }

    #[test]
    fn incomplete_frames_are_counted_not_forwarded() {
        let mut rig = rig(2);
        use SimOutcome::*;
        rig.probe.push_outcomes([
            Complete, Complete, Incomplete, Complete, Complete, Complete, Incomplete, Complete,
            Complete, Complete,
        ]);

        let mut displays = Vec::new();
        let mut analyses = Vec::new();
        for _ in 0..10 {
            rig.capture.step();
            displays.extend(rig.display.try_take());
            analyses.extend(rig.analysis.try_take());
        }

        assert_eq!(displays.len(), 8);
        assert_eq!(analyses.len(), 8);
        assert_eq!(rig.shared.telemetry.dropped_frames(), 2);
        assert_eq!(rig.shared.telemetry.frames_total(), 8);
        for (display, analysis) in displays.iter().zip(&analyses) {
            assert_eq!(display.sequence, analysis.sequence);
        }
        assert!(displays.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[test]
    fn status_follows_the_device() {
        let mut rig = rig(2);
        assert_eq!(*rig.shared.status(), CameraStatus::Initializing);
        assert!(matches!(rig.capture.step(), Step::Produced { .. }));
        assert!(rig.shared.is_streaming());
        assert_eq!(
            rig.shared.status().to_string(),
            "Capturing from Simulated Blackfly at 640 x 480"
        );
        assert_eq!(rig.shared.descriptor().unwrap().serial, "SIM-T");
        assert_eq!(rig.shared.resolution(), Some((640, 480)));

        rig.display.try_take();
        rig.analysis.try_take();
        rig.probe.push_outcomes([SimOutcome::Timeout]);
        assert_eq!(rig.capture.step(), Step::Dropped);
        assert_eq!(rig.shared.status().to_string(), "Dropped frame.");
    }

    #[test]
    fn binning_change_restarts_before_next_frame() {
        let mut rig = rig(2);
        rig.capture.step();
        rig.display.try_take();
        rig.analysis.try_take();

        rig.settings.update(|s| s.binning = 1);
        assert!(matches!(rig.capture.step(), Step::Produced { .. }));
        let counters = rig.probe.counters();
        assert_eq!(counters.end_acquisitions, 1);
        assert_eq!(counters.begin_acquisitions, 2);
        let frame = rig.display.try_take().unwrap();
        assert_eq!((frame.width, frame.height), (320, 240));
    }

    #[test]
    fn invalid_device_produces_nothing() {
        let mut rig = rig(2);
        rig.capture.step();
        rig.display.try_take();
        rig.analysis.try_take();

        rig.probe.invalidate();
        assert_eq!(rig.capture.step(), Step::Invalid);
        assert!(!rig.shared.is_streaming());
        assert!(rig.display.is_empty());
        assert_eq!(
            rig.shared.status().to_string(),
            "Camera status invalid. Attempting to restart."
        );
    }

    #[test]
    fn acquisition_error_counts_as_dropped() {
        let mut rig = rig(2);
        rig.probe.push_outcomes([SimOutcome::Error]);
        assert_eq!(rig.capture.step(), Step::Failed);
        assert_eq!(rig.shared.telemetry.dropped_total(), 1);
        assert_eq!(rig.shared.status().to_string(), "Dropped frame.");
        assert!(rig.display.is_empty());

        assert!(matches!(rig.capture.step(), Step::Produced { .. }));
    }

    #[test]
    fn failing_device_backs_off() {
        let mut rig = rig(2);
        rig.capture.options.idle_backoff = Duration::from_millis(100);
        rig.probe.push_outcomes(std::iter::repeat(SimOutcome::Error).take(10_000));
        let shared = Arc::clone(&rig.shared);
        let handle = rig.capture.spawn().unwrap();

        thread::sleep(Duration::from_millis(250));
        shared.request_quit();
        let mut manager = handle.join().unwrap();
        manager.shutdown();

        let failures = shared.telemetry.dropped_total();
        assert!((1..=4).contains(&failures), "{failures} failed acquisitions");
        assert!(rig.display.is_empty());
    }

    #[test]
    fn analysis_pair_is_ready_when_display_frame_arrives() {
        let Rig {
            capture,
            display,
            analysis,
            shared,
            ..
        } = rig(1);
        let handle = capture.spawn().unwrap();

        for _ in 0..50 {
            let frame = display.take(Duration::from_secs(5)).unwrap();
            let pair = analysis.try_take().unwrap();
            assert_eq!(pair.sequence, frame.sequence);
        }

        shared.request_quit();
        drop(display);
        drop(analysis);
        handle.join().unwrap().shutdown();
    }

    #[test]
    fn status_is_current_when_frame_arrives() {
        let Rig {
            capture,
            display,
            analysis,
            shared,
            settings,
            ..
        } = rig(1);
        let handle = capture.spawn().unwrap();

        for _ in 0..3 {
            display.take(Duration::from_secs(5)).unwrap();
            analysis.try_take();
        }
        settings.update(|s| s.binning = 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "binned frame never arrived");
            let Some(frame) = display.take(Duration::from_millis(100)) else {
                continue;
            };
            analysis.try_take();
            if frame.width == 320 {
                assert_eq!(
                    shared.status().to_string(),
                    "Capturing from Simulated Blackfly at 320 x 240"
                );
                assert!(shared.is_streaming());
                break;
            }
        }

        shared.request_quit();
        drop(display);
        drop(analysis);
        handle.join().unwrap().shutdown();
    }

    #[test]
    fn quit_unblocks_a_full_buffer_and_returns_the_manager() {
        let rig = rig(1);
        let shared = Arc::clone(&rig.shared);
        let handle = rig.capture.spawn().unwrap();

        // Wait until the producer is parked on the full display buffer
        let deadline = Instant::now() + Duration::from_secs(5);
        while rig.display.len() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(rig.display.len(), 1);

        shared.request_quit();
        let mut manager = handle.join().unwrap();
        assert!(!shared.is_streaming());
        manager.shutdown();
        assert!(!rig.probe.is_open());
    }
}
