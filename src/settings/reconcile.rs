//! Keeps the live device configuration in line with the desired settings.
//!
//! Runs once per capture iteration on the capture thread. After a user edit,
//! or once the device came up again, each tracked setting is compared
//! against the device and only differences are written. Only settings the
//! device refuses to change while acquiring stop the stream. Values the
//! device clamps or rejects, and values its auto modes move, flow back into
//! the desired settings and the store.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    DesiredSettings, SettingsHandle, SettingsStore, KEY_BALANCE_RATIO, KEY_BINNING, KEY_EXPOSURE,
    KEY_PIXEL_FORMAT, KEY_THROUGHPUT_LIMIT,
};
use crate::capture::PixelFormat;
use crate::device::{
    CameraDevice, DeviceLifecycleManager, SdkLogLevel, BALANCE_RATIO, BINNING_HORIZONTAL,
    BINNING_VERTICAL, EXPOSURE_TIME, PIXEL_FORMAT, THROUGHPUT_LIMIT,
};
use crate::error::{CameraError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    PixelFormat,
    Binning,
    ThroughputLimit,
    BalanceRatio,
    Exposure,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    Format(PixelFormat),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Int(v) => write!(f, "{v}"),
            SettingValue::Float(v) => write!(f, "{v}"),
            SettingValue::Format(v) => write!(f, "{v}"),
        }
    }
}

impl Setting {
    /// Order of application: stream-stopping settings first
    pub const ALL: [Setting; 5] = [
        Setting::PixelFormat,
        Setting::Binning,
        Setting::ThroughputLimit,
        Setting::BalanceRatio,
        Setting::Exposure,
    ];

    /// Settings the device may change on its own (auto modes)
    pub const PULLED: [Setting; 2] = [Setting::BalanceRatio, Setting::Exposure];

    pub fn requires_stop(self) -> bool {
        matches!(
            self,
            Setting::PixelFormat | Setting::Binning | Setting::ThroughputLimit
        )
    }

    /// Persisted settings key
    pub fn key(self) -> &'static str {
        match self {
            Setting::PixelFormat => KEY_PIXEL_FORMAT,
            Setting::Binning => KEY_BINNING,
            Setting::ThroughputLimit => KEY_THROUGHPUT_LIMIT,
            Setting::BalanceRatio => KEY_BALANCE_RATIO,
            Setting::Exposure => KEY_EXPOSURE,
        }
    }

    pub fn desired(self, settings: &DesiredSettings) -> Option<SettingValue> {
        Some(match self {
            Setting::PixelFormat => SettingValue::Format(settings.pixel_format?),
            Setting::Binning => SettingValue::Int(settings.binning),
            Setting::ThroughputLimit => SettingValue::Int(settings.throughput_limit),
            Setting::BalanceRatio => SettingValue::Float(settings.balance_ratio),
            Setting::Exposure => SettingValue::Float(settings.exposure_us),
        })
    }

    pub fn store_into(self, settings: &mut DesiredSettings, value: SettingValue) {
        match (self, value) {
            (Setting::PixelFormat, SettingValue::Format(v)) => settings.pixel_format = Some(v),
            (Setting::Binning, SettingValue::Int(v)) => settings.binning = v,
            (Setting::ThroughputLimit, SettingValue::Int(v)) => settings.throughput_limit = v,
            (Setting::BalanceRatio, SettingValue::Float(v)) => settings.balance_ratio = v,
            (Setting::Exposure, SettingValue::Float(v)) => settings.exposure_us = v,
            (setting, value) => warn!("Ignoring {} for {:?}", value, setting),
        }
    }

    pub fn live(self, device: &dyn CameraDevice) -> Result<SettingValue> {
        Ok(match self {
            Setting::PixelFormat => {
                let entry = device.enum_node(PIXEL_FORMAT)?;
                let format = PixelFormat::from_node_name(&entry)
                    .ok_or(CameraError::UnsupportedFormat(entry))?;
                SettingValue::Format(format)
            }
            // Binning only reads back from the horizontal node, which counts from 1
            Setting::Binning => SettingValue::Int(device.int_node(BINNING_HORIZONTAL)? - 1),
            Setting::ThroughputLimit => SettingValue::Int(device.int_node(THROUGHPUT_LIMIT)?),
            Setting::BalanceRatio => SettingValue::Float(device.float_node(BALANCE_RATIO)?),
            Setting::Exposure => SettingValue::Float(device.float_node(EXPOSURE_TIME)?),
        })
    }

    /// Writes `value` and returns what the device applied
    pub fn write(self, device: &mut dyn CameraDevice, value: SettingValue) -> Result<SettingValue> {
        let mismatch = || CameraError::ParameterRejected {
            name: self.key().into(),
            reason: format!("unexpected value {value}"),
        };
        Ok(match (self, value) {
            (Setting::PixelFormat, SettingValue::Format(format)) => {
                let applied = device.set_enum_node(PIXEL_FORMAT, format.node_name())?;
                SettingValue::Format(
                    PixelFormat::from_node_name(&applied)
                        .ok_or(CameraError::UnsupportedFormat(applied))?,
                )
            }
            (Setting::Binning, SettingValue::Int(binning)) => {
                let horizontal = device.set_int_node(BINNING_HORIZONTAL, binning + 1)?;
                device.set_int_node(BINNING_VERTICAL, binning + 1)?;
                SettingValue::Int(horizontal - 1)
            }
            (Setting::ThroughputLimit, SettingValue::Int(limit)) => {
                SettingValue::Int(device.set_int_node(THROUGHPUT_LIMIT, limit)?)
            }
            (Setting::BalanceRatio, SettingValue::Float(ratio)) => {
                SettingValue::Float(device.set_float_node(BALANCE_RATIO, ratio)?)
            }
            (Setting::Exposure, SettingValue::Float(exposure)) => {
                SettingValue::Float(device.set_float_node(EXPOSURE_TIME, exposure)?)
            }
            _ => return Err(mismatch()),
        })
    }
}

/// What one reconciliation pass did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    /// The stream was stopped and must be restarted
    pub stopped_stream: bool,
    /// Settings written to the device
    pub written: Vec<Setting>,
    /// Settings whose device value was adopted into the desired settings
    pub adopted: Vec<(Setting, SettingValue)>,
    /// A user edit raced the pass; feedback was dropped and is retried next pass
    pub deferred: bool,
    /// A write left the device half configured; the write pass repeats
    pub retry: bool,
}

pub struct SettingsReconciler {
    settings: SettingsHandle,
    store: Arc<dyn SettingsStore>,
    applied_log_level: Option<SdkLogLevel>,
    /// Settings version and device initialization last written out
    applied: Option<(u64, u64)>,
}

impl SettingsReconciler {
    pub fn new(settings: SettingsHandle, store: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            store,
            applied_log_level: None,
            applied: None,
        }
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Single entry point, called between frames. A no-op unless the
    /// device is initialized and valid.
    pub fn reconcile(&mut self, manager: &mut DeviceLifecycleManager) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let snapshot = self.settings.snapshot();

        self.apply_log_level(manager, snapshot.settings.log_level);

        if !manager
            .device()
            .is_some_and(|d| d.is_initialized() && d.is_valid())
        {
            return report;
        }

        let mut effective = snapshot.settings.clone();
        let generation = (snapshot.version, manager.initializations());
        if self.applied != Some(generation) {
            for setting in Setting::ALL {
                if let Some(applied) = self.apply(manager, setting, &effective, &mut report) {
                    setting.store_into(&mut effective, applied);
                    report.adopted.push((setting, applied));
                }
            }
            self.applied = (!report.retry).then_some(generation);
        }

        // Auto modes move these on the device; follow them
        if let Some(device) = manager.device() {
            for setting in Setting::PULLED {
                let Ok(live) = setting.live(device) else {
                    continue;
                };
                if setting.desired(&effective) != Some(live) {
                    debug!("{} changed on the device to {}", setting.key(), live);
                    setting.store_into(&mut effective, live);
                    report.adopted.push((setting, live));
                }
            }
        }

        if report.adopted.is_empty() {
            return report;
        }
        let adopted = report.adopted.clone();
        let landed = self.settings.adopt(snapshot.version, |settings| {
            for (setting, value) in &adopted {
                setting.store_into(settings, *value);
            }
        });
        if landed {
            let keys: Vec<&str> = adopted.iter().map(|(s, _)| s.key()).collect();
            effective.persist(self.store.as_ref(), &keys);
        } else {
            debug!("Desired settings changed during reconciliation, deferring feedback");
            report.deferred = true;
        }
        report
    }

    /// Compares and, if needed, writes one setting. Returns the device value
    /// to adopt when it differs from the desired one.
    fn apply(
        &self,
        manager: &mut DeviceLifecycleManager,
        setting: Setting,
        effective: &DesiredSettings,
        report: &mut ReconcileReport,
    ) -> Option<SettingValue> {
        let desired = setting.desired(effective)?;
        let device = manager.device()?;
        let live = match setting.live(device) {
            Ok(live) => live,
            Err(CameraError::ParameterUnavailable(name)) => {
                debug!("{} not available on this camera", name);
                return None;
            }
            Err(e) => {
                warn!("Unable to read {}: {}", setting.key(), e);
                return None;
            }
        };
        let split_axes =
            setting == Setting::Binning && matches!(binning_axes(device), Ok((h, v)) if h != v);
        if live == desired && !split_axes {
            return None;
        }

        if setting.requires_stop() && manager.check_streaming_stopped() {
            info!("Stopping stream to change {}", setting.key());
            report.stopped_stream = true;
        }

        let device = manager.device_mut()?;
        report.written.push(setting);
        let applied = match setting.write(device, desired) {
            Ok(applied) => applied,
            Err(e) => {
                warn!("Camera rejected {} = {}: {}", setting.key(), desired, e);
                if setting == Setting::Binning {
                    if let Ok((horizontal, vertical)) = binning_axes(&*device) {
                        warn!(horizontal, vertical, "Binning after failed write");
                        report.retry |= horizontal != vertical;
                    }
                }
                setting.live(device).ok()?
            }
        };
        if applied != desired {
            info!(
                "{} set to {} instead of {}",
                setting.key(),
                applied,
                desired
            );
            return Some(applied);
        }
        None
    }

    fn apply_log_level(&mut self, manager: &DeviceLifecycleManager, level: SdkLogLevel) {
        if self.applied_log_level == Some(level) {
            return;
        }
        if let Some(system) = manager.system() {
            debug!("Camera SDK log level {}", level);
            system.set_log_level(level);
            self.applied_log_level = Some(level);
        }
    }
}

fn binning_axes(device: &dyn CameraDevice) -> Result<(i64, i64)> {
    Ok((
        device.int_node(BINNING_HORIZONTAL)?,
        device.int_node(BINNING_VERTICAL)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimCameraSpec, SimProbe, SimSystem};
    use crate::device::{CameraSystem, SystemRegistry, DEFAULT_RETRY_INTERVAL};
    use crate::settings::MemorySettingsStore;

    struct Rig {
        manager: DeviceLifecycleManager,
        reconciler: SettingsReconciler,
        settings: SettingsHandle,
        store: Arc<MemorySettingsStore>,
        system: SimSystem,
        probe: SimProbe,
    }

    fn rig_with(spec: SimCameraSpec) -> Rig {
        let (system, probe) = SimSystem::with_camera(spec);
        let factory_system = system.clone();
        let registry = SystemRegistry::new(Box::new(move || {
            Ok(Arc::new(factory_system.clone()) as Arc<dyn CameraSystem>)
        }));
        let mut manager = DeviceLifecycleManager::new(registry, DEFAULT_RETRY_INTERVAL);
        assert!(manager.check_initialized());

        let settings = SettingsHandle::default();
        let store = Arc::new(MemorySettingsStore::new());
        let reconciler = SettingsReconciler::new(settings.clone(), store.clone());
        Rig {
            manager,
            reconciler,
            settings,
            store,
            system,
            probe,
        }
    }

    fn streaming_rig() -> Rig {
        let mut rig = rig_with(SimCameraSpec::new("SIM-R"));
        rig.reconciler.reconcile(&mut rig.manager);
        assert!(rig.manager.check_streaming());
        rig
    }

    #[test]
    fn equal_settings_never_stop_the_stream() {
        let mut rig = streaming_rig();
        for _ in 0..5 {
            let report = rig.reconciler.reconcile(&mut rig.manager);
            assert!(!report.stopped_stream);
            assert!(report.written.is_empty());
        }
        assert!(rig.manager.is_streaming());
        assert_eq!(rig.probe.counters().end_acquisitions, 0);
    }

    #[test]
    fn binning_writes_both_axes_plus_one() {
        let mut rig = rig_with(SimCameraSpec::new("SIM-B"));
        for b in [1, 2, 0, 3] {
            rig.settings.update(|s| s.binning = b);
            rig.reconciler.reconcile(&mut rig.manager);
            assert_eq!(rig.probe.binning(), (b + 1, b + 1));
        }
    }

    #[test]
    fn exposure_changes_without_stopping() {
        let mut rig = streaming_rig();
        rig.settings.update(|s| s.exposure_us = 2000.0);
        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert!(!report.stopped_stream);
        assert_eq!(report.written, vec![Setting::Exposure]);
        assert_eq!(rig.probe.exposure(), 2000.0);
        assert!(rig.manager.is_streaming());
    }

    #[test]
    fn binning_change_stops_the_stream() {
        let mut rig = streaming_rig();
        rig.settings.update(|s| s.binning = 1);
        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert!(report.stopped_stream);
        assert!(!rig.manager.is_streaming());
        assert_eq!(rig.probe.binning(), (2, 2));
        assert!(rig.manager.check_streaming());
        assert_eq!(rig.probe.counters().begin_acquisitions, 2);
    }

    #[test]
    fn clamped_value_is_adopted_and_persisted() {
        let mut rig = streaming_rig();
        rig.settings.update(|s| s.exposure_us = 99_000_000.0);
        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert_eq!(
            report.adopted,
            vec![(Setting::Exposure, SettingValue::Float(30_000_000.0))]
        );
        assert_eq!(rig.settings.get().exposure_us, 30_000_000.0);
        assert_eq!(
            rig.store.get(KEY_EXPOSURE),
            Some(toml::Value::Float(30_000_000.0))
        );

        // Converged: nothing left to write
        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert!(report.written.is_empty());
    }

    #[test]
    fn clamped_binning_is_adopted() {
        let mut rig = rig_with(SimCameraSpec::new("SIM-C"));
        rig.settings.update(|s| s.binning = 10);
        rig.reconciler.reconcile(&mut rig.manager);
        assert_eq!(rig.probe.binning(), (4, 4));
        assert_eq!(rig.settings.get().binning, 3);
        assert_eq!(rig.store.get(KEY_BINNING), Some(toml::Value::Integer(3)));
    }

    #[test]
    fn drifting_exposure_is_pulled_back() {
        let mut rig = streaming_rig();
        rig.probe.drift_exposure(4321.0);
        rig.probe.drift_balance_ratio(1.5);
        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert!(report.written.is_empty());
        let settings = rig.settings.get();
        assert_eq!(settings.exposure_us, 4321.0);
        assert_eq!(settings.balance_ratio, 1.5);
        assert_eq!(rig.store.get(KEY_EXPOSURE), Some(toml::Value::Float(4321.0)));
    }

    #[test]
    fn auto_exposure_is_followed_not_fought() {
        let mut rig = streaming_rig();
        let writes = rig.probe.counters().node_writes.len();
        for exposure in [1500.0, 2500.0, 800.0] {
            rig.probe.drift_exposure(exposure);
            let report = rig.reconciler.reconcile(&mut rig.manager);
            assert!(report.written.is_empty());
            assert_eq!(rig.probe.exposure(), exposure);
            assert_eq!(rig.settings.get().exposure_us, exposure);
        }
        assert_eq!(rig.probe.counters().node_writes.len(), writes);
    }

    #[test]
    fn reinitialized_camera_gets_settings_again() {
        let mut rig = streaming_rig();
        rig.settings.update(|s| s.exposure_us = 2000.0);
        rig.reconciler.reconcile(&mut rig.manager);
        assert_eq!(rig.probe.exposure(), 2000.0);

        rig.probe.power_cycle();
        let later = std::time::Instant::now() + DEFAULT_RETRY_INTERVAL;
        assert!(rig.manager.check_initialized_at(later));
        assert_eq!(rig.manager.initializations(), 2);

        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert_eq!(report.written, vec![Setting::Exposure]);
        assert_eq!(rig.probe.exposure(), 2000.0);
        assert_eq!(rig.settings.get().exposure_us, 2000.0);
    }

    #[test]
    fn half_applied_binning_is_retried() {
        let mut rig = streaming_rig();
        rig.probe.reject_writes(BINNING_VERTICAL);
        rig.settings.update(|s| s.binning = 1);
        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert!(report.retry);
        assert_eq!(rig.probe.binning(), (2, 1));

        rig.probe.accept_writes();
        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert_eq!(report.written, vec![Setting::Binning]);
        assert!(!report.retry);
        assert_eq!(rig.probe.binning(), (2, 2));

        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert!(report.written.is_empty());
    }

    #[test]
    fn user_edit_wins_over_device_drift() {
        let mut rig = streaming_rig();
        rig.probe.drift_exposure(4321.0);
        rig.settings.update(|s| s.exposure_us = 2000.0);
        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert_eq!(report.written, vec![Setting::Exposure]);
        assert!(report.adopted.is_empty());
        assert_eq!(rig.probe.exposure(), 2000.0);
        assert_eq!(rig.settings.get().exposure_us, 2000.0);
    }

    #[test]
    fn pixel_format_change_stops_and_applies() {
        let mut rig = streaming_rig();
        rig.settings.update(|s| s.pixel_format = Some(PixelFormat::Rgb8));
        let report = rig.reconciler.reconcile(&mut rig.manager);
        assert!(report.stopped_stream);
        assert_eq!(rig.probe.pixel_format(), PixelFormat::Rgb8);
    }

    #[test]
    fn log_level_is_applied_on_change() {
        let mut rig = streaming_rig();
        assert_eq!(rig.system.log_level(), SdkLogLevel::Warn);
        rig.settings.update(|s| s.log_level = SdkLogLevel::Debug);
        rig.reconciler.reconcile(&mut rig.manager);
        assert_eq!(rig.system.log_level(), SdkLogLevel::Debug);
    }

    #[test]
    fn uninitialized_device_is_left_alone() {
        let system = SimSystem::new();
        let factory_system = system.clone();
        let registry = SystemRegistry::new(Box::new(move || {
            Ok(Arc::new(factory_system.clone()) as Arc<dyn CameraSystem>)
        }));
        let mut manager = DeviceLifecycleManager::new(registry, DEFAULT_RETRY_INTERVAL);
        let mut reconciler =
            SettingsReconciler::new(SettingsHandle::default(), Arc::new(MemorySettingsStore::new()));
        assert_eq!(reconciler.reconcile(&mut manager), ReconcileReport::default());
    }
}
