//! Persisted user settings, keyed by name

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{CameraError, Result};

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<toml::Value>;
    fn set(&self, key: &str, value: toml::Value) -> Result<()>;
}

/// Typed read with a fallback for missing or mistyped values
pub fn get_or<T: DeserializeOwned>(store: &dyn SettingsStore, key: &str, default: T) -> T {
    let Some(value) = store.get(key) else {
        return default;
    };
    match value.try_into::<T>() {
        Ok(v) => v,
        Err(e) => {
            warn!("Ignoring stored setting {}: {}", key, e);
            default
        }
    }
}

/// Settings kept in a TOML file, rewritten on every `set`
pub struct TomlSettingsStore {
    path: PathBuf,
    table: Mutex<toml::Table>,
}

impl TomlSettingsStore {
    /// Loads `path` if it exists; a missing file starts empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let table = match fs::read_to_string(&path) {
            Ok(content) => content
                .parse::<toml::Table>()
                .map_err(|e| CameraError::Store(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}, starting empty", path.display());
                toml::Table::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, table: &toml::Table) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content =
            toml::to_string_pretty(table).map_err(|e| CameraError::Store(e.to_string()))?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl SettingsStore for TomlSettingsStore {
    fn get(&self, key: &str) -> Option<toml::Value> {
        self.table.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: toml::Value) -> Result<()> {
        let mut table = self.table.lock();
        if table.get(key) == Some(&value) {
            return Ok(());
        }
        table.insert(key.to_string(), value);
        self.write(&table)
    }
}

/// In-process store, nothing survives a restart
#[derive(Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, toml::Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<toml::Value> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: toml::Value) -> Result<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }
}
