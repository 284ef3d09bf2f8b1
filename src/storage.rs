//! Persisted settings document.
//!
//! A single JSON object (`settings.json` inside the data dir) read and
//! written as a whole. The agent only ever stores a handful of small values
//! (the cloud API key today), so whole-document writes keep the format
//! trivially inspectable and atomic enough via rename.
//!
//! The same data dir also hosts `tmp/` for the download-then-upload file
//! relay.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::warn;

/// Key/value settings persisted across restarts.
#[derive(Debug, Clone)]
pub struct Storage {
    settings_path: PathBuf,
    tmp_dir: PathBuf,
}

impl Storage {
    /// Create a storage handle rooted at `data_dir`. Directories are created
    /// lazily on first write.
    pub fn new(data_dir: &str) -> Self {
        let root = PathBuf::from(data_dir);
        Self {
            settings_path: root.join("settings.json"),
            tmp_dir: root.join("tmp"),
        }
    }

    /// Read a string setting, `None` if absent or the document is unreadable.
    pub fn get(&self, key: &str) -> Option<String> {
        let doc = self.read_document();
        doc.get(key).and_then(Value::as_str).map(str::to_string)
    }

    /// Write a string setting, keeping all other keys.
    pub fn set(&self, key: &str, value: &str) {
        let mut doc = self.read_document();
        doc.insert(key.to_string(), Value::String(value.to_string()));
        self.write_document(&doc);
    }

    /// Remove a setting, keeping all other keys.
    pub fn clear(&self, key: &str) {
        let mut doc = self.read_document();
        doc.remove(key);
        self.write_document(&doc);
    }

    /// Allocate a path under `tmp/` for a temporary download.
    pub fn temp_file_path(&self, file_name: &str) -> PathBuf {
        self.tmp_dir.join(file_name)
    }

    /// Best-effort removal of a temporary file.
    pub fn delete_temp_file(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Storage: failed to delete temp file {}: {e}", path.display());
        }
    }

    /// Ensure the tmp directory exists; returns false (logged) on failure.
    pub fn ensure_tmp_dir(&self) -> bool {
        match std::fs::create_dir_all(&self.tmp_dir) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Storage: failed to create {}: {e}",
                    self.tmp_dir.display()
                );
                false
            }
        }
    }

    fn read_document(&self) -> Map<String, Value> {
        match std::fs::read_to_string(&self.settings_path) {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!(
                        "Storage: {} is not a JSON object, starting fresh",
                        self.settings_path.display()
                    );
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        }
    }

    fn write_document(&self, doc: &Map<String, Value>) {
        if let Some(parent) = self.settings_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Storage: failed to create {}: {e}", parent.display());
                return;
            }
        }
        // Write-then-rename so a crash mid-write never truncates settings.
        let tmp = self.settings_path.with_extension("json.new");
        let content = serde_json::to_string_pretty(&Value::Object(doc.clone()))
            .unwrap_or_else(|_| "{}".to_string());
        if let Err(e) = std::fs::write(&tmp, content) {
            warn!("Storage: failed to write {}: {e}", tmp.display());
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.settings_path) {
            warn!(
                "Storage: failed to replace {}: {e}",
                self.settings_path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage(tag: &str) -> Storage {
        let dir = std::env::temp_dir().join(format!(
            "printlink-storage-{tag}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        Storage::new(dir.to_str().unwrap())
    }

    #[test]
    fn get_absent_key_is_none() {
        let storage = temp_storage("absent");
        assert_eq!(storage.get("cloud_api_key"), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let storage = temp_storage("roundtrip");
        storage.set("cloud_api_key", "K1");
        assert_eq!(storage.get("cloud_api_key").as_deref(), Some("K1"));
    }

    #[test]
    fn clear_removes_only_that_key() {
        let storage = temp_storage("clear");
        storage.set("cloud_api_key", "K1");
        storage.set("other", "kept");
        storage.clear("cloud_api_key");
        assert_eq!(storage.get("cloud_api_key"), None);
        assert_eq!(storage.get("other").as_deref(), Some("kept"));
    }

    #[test]
    fn overwrite_replaces_value() {
        let storage = temp_storage("overwrite");
        storage.set("cloud_api_key", "K1");
        storage.set("cloud_api_key", "K2");
        assert_eq!(storage.get("cloud_api_key").as_deref(), Some("K2"));
    }
}
