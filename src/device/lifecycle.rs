//! Device lifecycle: detect, assign, initialize, stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::{
    CameraDevice, CameraSystem, DeviceDescriptor, SdkLogLevel, SystemLease, SystemRegistry,
    BALANCE_RATIO, BINNING_HORIZONTAL, EXPOSURE_TIME, PIXEL_FORMAT, THROUGHPUT_LIMIT,
};
use crate::error::{CameraError, Result};
use crate::utils::CameraStatus;

/// Interval between initialization attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unassigned,
    Assigned,
    Initialized,
    Streaming,
    /// Initialization failed; reads as `Unassigned` once `retry_after` passed
    Failed { retry_after: Instant },
}

/// Owns the single device handle and walks it through its states
pub struct DeviceLifecycleManager {
    registry: Arc<SystemRegistry>,
    lease: Option<SystemLease>,
    device: Option<Box<dyn CameraDevice>>,
    state: DeviceState,
    retry_interval: Duration,
    last_attempt: Option<Instant>,
    log_level: SdkLogLevel,
    status: CameraStatus,
    initializations: u64,
}

impl DeviceLifecycleManager {
    pub fn new(registry: Arc<SystemRegistry>, retry_interval: Duration) -> Self {
        Self {
            registry,
            lease: None,
            device: None,
            state: DeviceState::Unassigned,
            retry_interval,
            last_attempt: None,
            log_level: SdkLogLevel::Off,
            status: CameraStatus::Initializing,
            initializations: 0,
        }
    }

    /// SDK log level used when this manager creates the camera system
    pub fn with_log_level(mut self, level: SdkLogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn state(&self) -> DeviceState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> DeviceState {
        match self.state {
            DeviceState::Failed { retry_after } if now >= retry_after => DeviceState::Unassigned,
            state => state,
        }
    }

    pub fn status(&self) -> &CameraStatus {
        &self.status
    }

    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref().map(|d| d.descriptor())
    }

    pub fn device(&self) -> Option<&dyn CameraDevice> {
        self.device.as_deref()
    }

    pub fn device_mut(&mut self) -> Option<&mut (dyn CameraDevice + 'static)> {
        self.device.as_deref_mut()
    }

    pub fn system(&self) -> Option<&Arc<dyn CameraSystem>> {
        self.lease.as_ref().map(|lease| lease.system())
    }

    /// Successful initializations so far. Changes whenever the device
    /// came up again and may have lost its configuration.
    pub fn initializations(&self) -> u64 {
        self.initializations
    }

    pub fn is_streaming(&self) -> bool {
        self.state == DeviceState::Streaming
    }

    fn acquire_system(&mut self) -> Result<Arc<dyn CameraSystem>> {
        if self.lease.is_none() {
            self.lease = Some(self.registry.acquire(self.log_level)?);
        }
        self.system().cloned().ok_or(CameraError::NoDevice)
    }

    /// Binds the first enumerated camera. Returns false when none is present.
    pub fn check_assigned(&mut self) -> bool {
        if self.device.is_some() {
            return true;
        }
        match self.assign_first() {
            Ok(assigned) => assigned,
            Err(e) => {
                warn!("Error enumerating cameras: {}", e);
                false
            }
        }
    }

    fn assign_first(&mut self) -> Result<bool> {
        let system = self.acquire_system()?;
        let cameras = system.enumerate()?;
        let Some(first) = cameras.first() else {
            info!("No cameras found");
            self.status = CameraStatus::NoCameras;
            self.state = DeviceState::Unassigned;
            return Ok(false);
        };

        info!(
            serial = %first.serial,
            "Assigning camera {} ({} available)",
            first.model,
            cameras.len()
        );
        self.device = Some(system.open(first.index)?);
        self.state = DeviceState::Assigned;
        Ok(true)
    }

    /// Fast when already initialized; otherwise attempts initialization at
    /// most once per retry interval.
    pub fn check_initialized(&mut self) -> bool {
        self.check_initialized_at(Instant::now())
    }

    #[instrument(skip(self, now), level = "debug")]
    pub fn check_initialized_at(&mut self, now: Instant) -> bool {
        if matches!(self.state, DeviceState::Initialized | DeviceState::Streaming)
            && self.device.as_ref().is_some_and(|d| d.is_initialized())
        {
            return true;
        }

        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < self.retry_interval {
                return false;
            }
        }
        self.last_attempt = Some(now);

        match self.try_initialize() {
            Ok(true) => {
                self.state = DeviceState::Initialized;
                self.initializations += 1;
                if let Some(descriptor) = self.descriptor() {
                    info!(serial = %descriptor.serial, "Camera {} initialized", descriptor.model);
                }
                true
            }
            Ok(false) => {
                info!(
                    "Initializing camera failed, retrying in {} seconds.",
                    self.retry_interval.as_secs_f32()
                );
                false
            }
            Err(e) => {
                warn!("Error initializing camera: {}", e);
                info!(
                    "Initializing camera failed, retrying in {} seconds.",
                    self.retry_interval.as_secs_f32()
                );
                self.device = None;
                self.state = DeviceState::Failed {
                    retry_after: now + self.retry_interval,
                };
                self.status = CameraStatus::InitFailed {
                    retry_in: self.retry_interval,
                };
                false
            }
        }
    }

    fn try_initialize(&mut self) -> Result<bool> {
        self.acquire_system()?;
        if self.device.is_none() && !self.assign_first()? {
            return Ok(false);
        }
        let device = self.device.as_mut().ok_or(CameraError::NoDevice)?;
        debug!(
            serial = %device.descriptor().serial,
            "Initializing camera {}",
            device.descriptor().index
        );
        device.init()?;
        Ok(true)
    }

    /// Starts acquisition unless already streaming
    pub fn check_streaming(&mut self) -> bool {
        match self.state {
            DeviceState::Streaming => true,
            DeviceState::Initialized => {
                let Some(device) = self.device.as_mut() else {
                    return false;
                };
                match device.begin_acquisition() {
                    Ok(()) => {
                        debug!("Acquisition started");
                        self.state = DeviceState::Streaming;
                        true
                    }
                    Err(e) => {
                        warn!("Unable to start camera: {}", e);
                        self.status = CameraStatus::StartFailed;
                        false
                    }
                }
            }
            _ => false,
        }
    }

    /// Ends acquisition. Returns true if the stream was running, i.e. the
    /// caller owes a restart.
    pub fn check_streaming_stopped(&mut self) -> bool {
        if self.state != DeviceState::Streaming {
            return false;
        }
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.end_acquisition() {
                warn!("Error ending acquisition: {}", e);
            }
        }
        debug!("Acquisition stopped");
        self.state = DeviceState::Initialized;
        true
    }

    /// Checks the handle before an acquisition. An invalid handle is stopped,
    /// deinitialized and left assigned for the next initialization attempt.
    pub fn check_valid(&mut self) -> bool {
        let Some(device) = self.device.as_ref() else {
            return false;
        };
        if device.is_valid() {
            return true;
        }

        warn!("Camera status invalid.");
        self.check_streaming_stopped();
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.deinit() {
                warn!("Error deinitializing invalid camera: {}", e);
            }
        }
        self.state = DeviceState::Assigned;
        self.status = CameraStatus::Invalid;
        false
    }

    pub(crate) fn set_status(&mut self, status: CameraStatus) {
        self.status = status;
    }

    /// Logs the identity and current node values of the bound camera
    pub fn print_info(&self) {
        let Some(device) = self.device.as_deref() else {
            info!("No camera assigned");
            return;
        };
        let descriptor = device.descriptor();
        info!(
            serial = %descriptor.serial,
            model = %descriptor.model,
            index = descriptor.index,
            "Camera info"
        );
        if !device.is_initialized() {
            return;
        }
        let ints = [BINNING_HORIZONTAL, THROUGHPUT_LIMIT];
        for name in ints {
            match device.int_node(name) {
                Ok(v) => info!("  {} = {}", name, v),
                Err(e) => debug!("  {}: {}", name, e),
            }
        }
        for name in [EXPOSURE_TIME, BALANCE_RATIO] {
            match device.float_node(name) {
                Ok(v) => info!("  {} = {}", name, v),
                Err(e) => debug!("  {}: {}", name, e),
            }
        }
        match device.enum_node(PIXEL_FORMAT) {
            Ok(v) => info!("  {} = {}", PIXEL_FORMAT, v),
            Err(e) => debug!("  {}: {}", PIXEL_FORMAT, e),
        }
    }

    /// Stops, deinitializes and releases the camera and the system lease
    pub fn shutdown(&mut self) {
        self.check_streaming_stopped();
        if let Some(mut device) = self.device.take() {
            if device.is_initialized() {
                if let Err(e) = device.deinit() {
                    warn!("Error deinitializing camera: {}", e);
                }
            }
            info!(serial = %device.descriptor().serial, "Camera released");
        }
        self.lease = None;
        self.state = DeviceState::Unassigned;
        self.status = CameraStatus::Stopped;
    }
}

impl Drop for DeviceLifecycleManager {
    fn drop(&mut self) {
        if self.device.is_some() || self.lease.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimCameraSpec, SimProbe, SimSystem};

    fn registry(system: &SimSystem) -> Arc<SystemRegistry> {
        let system = system.clone();
        SystemRegistry::new(Box::new(move || {
            Ok(Arc::new(system.clone()) as Arc<dyn CameraSystem>)
        }))
    }

    fn manager_with_camera() -> (DeviceLifecycleManager, SimSystem, SimProbe) {
        let (system, probe) = SimSystem::with_camera(SimCameraSpec::new("SIM-1"));
        let manager = DeviceLifecycleManager::new(registry(&system), DEFAULT_RETRY_INTERVAL);
        (manager, system, probe)
    }

    #[test]
    fn no_camera_stays_unassigned() {
        let system = SimSystem::new();
        let mut manager = DeviceLifecycleManager::new(registry(&system), DEFAULT_RETRY_INTERVAL);
        assert!(!manager.check_assigned());
        assert_eq!(manager.state(), DeviceState::Unassigned);
        assert_eq!(manager.status().to_string(), "No cameras found");
        assert!(!manager.check_initialized());
    }

    #[test]
    fn walks_through_states() {
        let (mut manager, _system, probe) = manager_with_camera();
        assert!(manager.check_assigned());
        assert_eq!(manager.state(), DeviceState::Assigned);
        assert!(manager.check_initialized());
        assert_eq!(manager.state(), DeviceState::Initialized);
        assert!(manager.check_streaming());
        assert!(manager.is_streaming());
        assert!(probe.is_streaming());
        assert!(manager.check_streaming_stopped());
        assert!(!manager.check_streaming_stopped());
        assert_eq!(probe.counters().end_acquisitions, 1);
    }

    #[test]
    fn initialized_fast_path_does_not_touch_hardware() {
        let (mut manager, system, probe) = manager_with_camera();
        assert!(manager.check_initialized());
        let enumerations = system.enumerate_count();
        for _ in 0..5 {
            assert!(manager.check_initialized());
        }
        assert_eq!(probe.counters().init_attempts, 1);
        assert_eq!(manager.initializations(), 1);
        assert_eq!(system.enumerate_count(), enumerations);
    }

    #[test]
    fn failed_init_backs_off() {
        let (mut manager, _system, probe) = manager_with_camera();
        probe.set_init_failures(1);
        let start = Instant::now();

        assert!(!manager.check_initialized_at(start));
        assert!(matches!(manager.state_at(start), DeviceState::Failed { .. }));
        assert!(!manager.check_initialized_at(start + Duration::from_millis(500)));
        assert_eq!(probe.counters().init_attempts, 1);
        assert!(!probe.is_open());

        let later = start + DEFAULT_RETRY_INTERVAL;
        assert_eq!(manager.state_at(later), DeviceState::Unassigned);
        assert!(manager.check_initialized_at(later));
        assert_eq!(probe.counters().init_attempts, 2);
    }

    #[test]
    fn invalid_handle_is_stopped_and_deinitialized() {
        let (mut manager, _system, probe) = manager_with_camera();
        assert!(manager.check_initialized());
        assert!(manager.check_streaming());
        assert!(manager.check_valid());

        probe.invalidate();
        assert!(!manager.check_valid());
        assert_eq!(manager.state(), DeviceState::Assigned);
        assert_eq!(*manager.status(), CameraStatus::Invalid);
        let counters = probe.counters();
        assert_eq!(counters.end_acquisitions, 1);
        assert_eq!(counters.deinits, 1);
    }

    #[test]
    fn shutdown_releases_camera_and_system() {
        let (mut manager, system, probe) = manager_with_camera();
        assert!(manager.check_initialized());
        assert!(manager.check_streaming());
        manager.shutdown();
        assert!(!probe.is_open());
        assert!(!probe.is_initialized());
        assert_eq!(system.shutdown_count(), 1);
        assert_eq!(manager.state(), DeviceState::Unassigned);
    }

    #[test]
    fn system_is_created_on_first_attempt() {
        let (mut manager, system, _probe) = manager_with_camera();
        assert!(!system.has_log_handler());
        assert!(manager.system().is_none());
        manager.check_initialized();
        assert!(system.has_log_handler());
        assert!(manager.system().is_some());
    }
}
