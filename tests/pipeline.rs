use std::sync::Arc;
use std::time::{Duration, Instant};

use argus::capture::DisplayFrame;
use argus::device::sim::{SimCameraSpec, SimOutcome, SimProbe, SimSystem};
use argus::device::{CameraSystem, SystemRegistry};
use argus::settings::{
    DesiredSettings, MemorySettingsStore, SettingsHandle, SettingsStore, KEY_EXPOSURE,
};
use argus::{CameraFacade, Config};

fn test_config() -> Config {
    let mut config = Config::default();
    config.camera.retry_interval_ms = 50;
    config.camera.acquire_timeout_ms = 20;
    config.pipeline.frame_wait_ms = 50;
    config.pipeline.idle_backoff_ms = 5;
    config
}

fn registry(system: &SimSystem) -> Arc<SystemRegistry> {
    let system = system.clone();
    SystemRegistry::new(Box::new(move || {
        Ok(Arc::new(system.clone()) as Arc<dyn CameraSystem>)
    }))
}

struct Rig {
    camera: CameraFacade,
    system: SimSystem,
    probe: SimProbe,
    settings: SettingsHandle,
    store: Arc<MemorySettingsStore>,
}

fn rig() -> Rig {
    let (system, probe) = SimSystem::with_camera(SimCameraSpec::new("SIM-A"));
    let settings = SettingsHandle::new(DesiredSettings::default());
    let store = Arc::new(MemorySettingsStore::new());
    let camera = CameraFacade::new(
        &test_config(),
        registry(&system),
        settings.clone(),
        store.clone(),
    );
    Rig {
        camera,
        system,
        probe,
        settings,
        store,
    }
}

/// Reads display frames until one satisfies `done` or five seconds pass
fn frame_where(
    camera: &mut CameraFacade,
    done: impl Fn(&DisplayFrame) -> bool,
) -> Option<DisplayFrame> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(frame) = camera.latest_display_frame() {
            if done(&frame) {
                return Some(frame);
            }
        }
    }
    None
}

#[test]
fn no_camera_starts_no_thread() {
    let system = SimSystem::new();
    let mut camera = CameraFacade::new(
        &test_config(),
        registry(&system),
        SettingsHandle::default(),
        Arc::new(MemorySettingsStore::new()),
    );

    for _ in 0..3 {
        assert!(camera.latest_display_frame().is_none());
    }
    assert!(!camera.is_running());
    assert!(!camera.is_streaming());
    assert_eq!(camera.status().to_string(), "No cameras found");
    assert_eq!(camera.serial_number(), None);
    assert!(camera.latest_analysis_frame().is_none());
}

#[test]
fn incomplete_frames_are_dropped_not_delivered() {
    let mut rig = rig();
    use SimOutcome::*;
    rig.probe.push_outcomes([
        Complete, Complete, Incomplete, Complete, Complete, Complete, Incomplete, Complete,
        Complete, Complete,
    ]);

    let mut sequences = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while sequences.len() < 8 && Instant::now() < deadline {
        if let Some(frame) = rig.camera.latest_display_frame() {
            sequences.push(frame.sequence);
        }
    }

    assert_eq!(sequences, vec![1, 2, 4, 5, 6, 8, 9, 10]);
    assert_eq!(rig.camera.dropped_total(), 2);
    assert!(rig.camera.dropped_frames() <= 2);
    assert!(rig.camera.latest_analysis_frame().is_some());
    assert!(rig.camera.is_streaming());
    assert_eq!(rig.camera.serial_number().as_deref(), Some("SIM-A"));
}

#[test]
fn display_and_analysis_carry_the_same_pixels() {
    let mut rig = rig();
    let display = frame_where(&mut rig.camera, |_| true).unwrap();
    let analysis = rig.camera.latest_analysis_frame().unwrap();

    assert_eq!(analysis.channels, 1);
    assert_eq!((analysis.width, analysis.height), (display.width, display.height));
    if analysis.sequence == display.sequence {
        // Mono source: every RGBA pixel repeats the analysis byte
        for x in 0..8u32 {
            let gray = analysis.pixel(x, 0).unwrap()[0];
            let offset = x as usize * 4;
            assert_eq!(&display.pixels[offset..offset + 4], &[gray, gray, gray, 255]);
        }
    }
}

#[test]
fn exposure_change_keeps_streaming() {
    let mut rig = rig();
    frame_where(&mut rig.camera, |_| true).unwrap();
    assert_eq!(rig.probe.exposure(), 1000.0);

    rig.settings.update(|s| s.exposure_us = 2000.0);
    let deadline = Instant::now() + Duration::from_secs(5);
    while rig.probe.exposure() != 2000.0 && Instant::now() < deadline {
        rig.camera.latest_display_frame();
    }

    assert_eq!(rig.probe.exposure(), 2000.0);
    assert_eq!(rig.probe.counters().end_acquisitions, 0);
    assert_eq!(rig.settings.get().exposure_us, 2000.0);
    assert!(rig.camera.is_streaming());
}

#[test]
fn clamped_exposure_is_adopted_and_persisted() {
    let mut rig = rig();
    frame_where(&mut rig.camera, |_| true).unwrap();

    rig.settings.update(|s| s.exposure_us = 1.0);
    let deadline = Instant::now() + Duration::from_secs(5);
    while rig.settings.get().exposure_us != 10.0 && Instant::now() < deadline {
        rig.camera.latest_display_frame();
    }
    assert_eq!(rig.probe.exposure(), 10.0);
    assert_eq!(rig.store.get(KEY_EXPOSURE), Some(toml::Value::Float(10.0)));
}

#[test]
fn binning_change_restarts_the_stream() {
    let mut rig = rig();
    let first = frame_where(&mut rig.camera, |_| true).unwrap();
    assert_eq!((first.width, first.height), (640, 480));

    rig.settings.update(|s| s.binning = 1);
    let binned = frame_where(&mut rig.camera, |f| f.width == 320).unwrap();

    assert_eq!((binned.width, binned.height), (320, 240));
    assert_eq!(rig.probe.binning(), (2, 2));
    let counters = rig.probe.counters();
    assert_eq!(counters.end_acquisitions, 1);
    assert_eq!(counters.begin_acquisitions, 2);
    assert_eq!(
        rig.camera.status().to_string(),
        "Capturing from Simulated Blackfly at 320 x 240"
    );
}

#[test]
fn replugged_camera_is_picked_up() {
    let mut rig = rig();
    frame_where(&mut rig.camera, |_| true).unwrap();

    rig.system.unplug("SIM-A");
    let replacement = rig.system.plug(SimCameraSpec::new("SIM-B"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while rig.camera.serial_number().as_deref() != Some("SIM-B") && Instant::now() < deadline {
        rig.camera.latest_display_frame();
    }
    assert_eq!(rig.camera.serial_number().as_deref(), Some("SIM-B"));
    assert!(frame_where(&mut rig.camera, |_| true).is_some());
    assert!(replacement.is_streaming());
    assert!(!rig.probe.is_open());
}

#[test]
fn shutdown_releases_camera_and_system() {
    let mut rig = rig();
    frame_where(&mut rig.camera, |_| true).unwrap();

    rig.camera.shutdown();
    assert!(!rig.probe.is_open());
    assert!(!rig.probe.is_initialized());
    assert_eq!(rig.system.shutdown_count(), 1);
    assert!(!rig.system.has_log_handler());
    assert_eq!(rig.camera.status().to_string(), "Camera stopped.");
    assert!(rig.camera.latest_display_frame().is_none());

    // Second shutdown is a no-op
    rig.camera.shutdown();
    assert_eq!(rig.system.shutdown_count(), 1);
}
