//! Persisted key/value configuration

use crate::types::{QcError, QcResult};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key/value store holding toolbox properties
pub trait PropertyStore: Send + Sync {
    fn read(&self, key: &str) -> QcResult<Option<String>>;
    fn write(&self, key: &str, value: &str) -> QcResult<()>;
}

/// In-memory store, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
        self
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn read(&self, key: &str) -> QcResult<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| QcError::Configuration("property store lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> QcResult<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| QcError::Configuration("property store lock poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// TOML file backed store.
///
/// Nested tables are addressed with dotted keys, so `[toolbox] qc_set = 2` and
/// `"toolbox.qc_set" = "2"` are the same property.
#[derive(Debug)]
pub struct TomlPropertyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TomlPropertyStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// `<config dir>/moorqc/properties.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("moorqc").join("properties.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> QcResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let table: toml::Table = toml::from_str(&content)?;
        let mut values = BTreeMap::new();
        flatten("", &table, &mut values);
        Ok(values)
    }
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            toml::Value::Table(inner) => flatten(&key, inner, out),
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            other => {
                out.insert(key, other.to_string());
            }
        }
    }
}

impl PropertyStore for TomlPropertyStore {
    fn read(&self, key: &str) -> QcResult<Option<String>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| QcError::Configuration("property file lock poisoned".to_string()))?;
        Ok(self.load()?.remove(key))
    }

    fn write(&self, key: &str, value: &str) -> QcResult<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| QcError::Configuration("property file lock poisoned".to_string()))?;
        let mut values = self.load()?;
        values.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, toml::to_string(&values)?)?;
        log::debug!("Wrote property {} to {}", key, self.path.display());
        Ok(())
    }
}
