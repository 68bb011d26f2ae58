//! Key/value backends for the host proxy settings.
//!
//! The coordinator only ever talks to a `SettingsStore`; the host-specific
//! registry or network-service plumbing lives behind it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Whether the system proxy is switched on: `"1"` or `"0"`.
pub const KEY_PROXY_ENABLE: &str = "ProxyEnable";
/// `host:port` of the proxy server.
pub const KEY_PROXY_SERVER: &str = "ProxyServer";
/// Semicolon-separated bypass list.
pub const KEY_PROXY_OVERRIDE: &str = "ProxyOverride";

/// Host settings backend.
pub trait SettingsStore: Send + Sync {
    /// Reads a value. `Ok(None)` when the key is unset.
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Removes a key. Removing an unset key succeeds.
    fn delete(&self, key: &str) -> Result<()>;
    /// Tells running applications that the settings changed.
    fn notify_changed(&self) -> Result<()>;
}

/// In-process store, used by tests and as a dry-run backend.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<BTreeMap<String, String>>,
    notifications: AtomicUsize,
    fail_notify: AtomicBool,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `notify_changed` succeeded.
    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    /// Makes subsequent `notify_changed` calls fail.
    pub fn set_fail_notify(&self, fail: bool) {
        self.fail_notify.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }

    fn notify_changed(&self) -> Result<()> {
        if self.fail_notify.load(Ordering::SeqCst) {
            anyhow::bail!("settings change broadcast rejected");
        }
        self.notifications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Stores the settings as a flat JSON object on disk.
///
/// Every write rewrites the whole file; the map is a handful of keys.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, text).with_context(|| format!("writing {}", self.path.display()))
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut values = self.load()?;
        f(&mut values);
        self.save(&values)
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }

    fn notify_changed(&self) -> Result<()> {
        log::debug!("Proxy settings written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("proxy.json");

        let store = FileSettingsStore::new(&path);
        store.set(KEY_PROXY_SERVER, "127.0.0.1:7890").unwrap();
        store.set(KEY_PROXY_ENABLE, "1").unwrap();
        store.delete(KEY_PROXY_ENABLE).unwrap();

        let reopened = FileSettingsStore::new(&path);
        assert_eq!(reopened.get(KEY_PROXY_SERVER).unwrap().as_deref(), Some("127.0.0.1:7890"));
        assert_eq!(reopened.get(KEY_PROXY_ENABLE).unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(FileSettingsStore::new(&path).get(KEY_PROXY_SERVER).is_err());
    }

    #[test]
    fn memory_store_counts_notifications() {
        let store = MemorySettingsStore::new();
        store.notify_changed().unwrap();
        store.set_fail_notify(true);
        assert!(store.notify_changed().is_err());
        assert_eq!(store.notifications(), 1);
    }
}
