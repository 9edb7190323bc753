//! Desired camera settings and their publication between the UI and the
//! capture thread.
//!
//! The UI writes through [`SettingsHandle::update`], which bumps the
//! version. The reconciler writes device feedback through
//! [`SettingsHandle::adopt`], which only lands if no UI write happened since
//! the snapshot it worked from.

pub mod reconcile;
pub mod store;

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capture::PixelFormat;
use crate::device::SdkLogLevel;
use crate::error::Result;

pub use reconcile::{ReconcileReport, Setting, SettingValue, SettingsReconciler};
pub use store::{get_or, MemorySettingsStore, SettingsStore, TomlSettingsStore};

pub const KEY_BINNING: &str = "Binning";
pub const KEY_BALANCE_RATIO: &str = "BalanceRatio";
pub const KEY_EXPOSURE: &str = "ExposureTimeAbs";
pub const KEY_THROUGHPUT_LIMIT: &str = "DeviceLinkThroughputLimit";
pub const KEY_PIXEL_FORMAT: &str = "PixelFormat";
pub const KEY_LOG_LEVEL: &str = "LogLevelIndex";

pub const ALL_KEYS: [&str; 6] = [
    KEY_BINNING,
    KEY_BALANCE_RATIO,
    KEY_EXPOSURE,
    KEY_THROUGHPUT_LIMIT,
    KEY_PIXEL_FORMAT,
    KEY_LOG_LEVEL,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredSettings {
    /// 0 means no binning, `b` bins `b + 1` pixels per axis
    pub binning: i64,
    pub balance_ratio: f64,
    /// Microseconds
    pub exposure_us: f64,
    /// Bytes per second
    pub throughput_limit: i64,
    /// `None` leaves the device's own format in place
    pub pixel_format: Option<PixelFormat>,
    pub log_level: SdkLogLevel,
}

impl Default for DesiredSettings {
    fn default() -> Self {
        Self {
            binning: 0,
            balance_ratio: 1.0,
            exposure_us: 1000.0,
            throughput_limit: 125_000_000,
            pixel_format: None,
            log_level: SdkLogLevel::Warn,
        }
    }
}

impl DesiredSettings {
    /// Defaults overridden by whatever the store holds
    pub fn load_from(store: &dyn SettingsStore) -> Self {
        let defaults = Self::default();
        let pixel_format = store
            .get(KEY_PIXEL_FORMAT)
            .and_then(|v| v.as_str().and_then(PixelFormat::from_node_name))
            .or(defaults.pixel_format);
        Self {
            binning: get_or(store, KEY_BINNING, defaults.binning),
            balance_ratio: get_or(store, KEY_BALANCE_RATIO, defaults.balance_ratio),
            exposure_us: get_or(store, KEY_EXPOSURE, defaults.exposure_us),
            throughput_limit: get_or(store, KEY_THROUGHPUT_LIMIT, defaults.throughput_limit),
            pixel_format,
            log_level: SdkLogLevel::from_index(get_or(
                store,
                KEY_LOG_LEVEL,
                defaults.log_level.index(),
            )),
        }
    }

    /// Stored representation of one field
    pub fn store_value(&self, key: &str) -> Option<toml::Value> {
        let value = match key {
            KEY_BINNING => toml::Value::Integer(self.binning),
            KEY_BALANCE_RATIO => toml::Value::Float(self.balance_ratio),
            KEY_EXPOSURE => toml::Value::Float(self.exposure_us),
            KEY_THROUGHPUT_LIMIT => toml::Value::Integer(self.throughput_limit),
            KEY_PIXEL_FORMAT => toml::Value::String(self.pixel_format?.node_name().into()),
            KEY_LOG_LEVEL => toml::Value::Integer(self.log_level.index()),
            _ => return None,
        };
        Some(value)
    }

    /// Writes the named fields to the store. Failures are logged and skipped.
    pub fn persist(&self, store: &dyn SettingsStore, keys: &[&str]) {
        for key in keys {
            let Some(value) = self.store_value(key) else {
                continue;
            };
            if let Err(e) = store.set(key, value) {
                warn!("Failed to persist setting {}: {}", key, e);
            }
        }
    }
}

/// One published state of the desired settings
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    pub version: u64,
    pub settings: DesiredSettings,
}

/// Shared, atomically published desired settings
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<SettingsSnapshot>>,
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(DesiredSettings::default())
    }
}

impl SettingsHandle {
    pub fn new(settings: DesiredSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(SettingsSnapshot {
                version: 0,
                settings,
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<SettingsSnapshot> {
        self.inner.load_full()
    }

    pub fn version(&self) -> u64 {
        self.inner.load().version
    }

    pub fn get(&self) -> DesiredSettings {
        self.inner.load().settings.clone()
    }

    /// User edit: applies `edit` and marks the settings dirty. Returns the
    /// new version.
    pub fn update(&self, edit: impl Fn(&mut DesiredSettings)) -> u64 {
        let previous = self.inner.rcu(|current| {
            let mut settings = current.settings.clone();
            edit(&mut settings);
            SettingsSnapshot {
                version: current.version + 1,
                settings,
            }
        });
        previous.version + 1
    }

    /// Device feedback: applies `edit` only if the settings are still at
    /// `seen_version`. Does not mark them dirty.
    pub fn adopt(&self, seen_version: u64, edit: impl Fn(&mut DesiredSettings)) -> bool {
        loop {
            let current = self.inner.load_full();
            if current.version != seen_version {
                return false;
            }
            let mut settings = current.settings.clone();
            edit(&mut settings);
            let next = Arc::new(SettingsSnapshot {
                version: seen_version,
                settings,
            });
            let previous = self.inner.compare_and_swap(&current, next);
            if Arc::ptr_eq(&previous, &current) {
                return true;
            }
        }
    }
}
