use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::warn;

/// Errors returned by raw storage backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend ran out of capacity while writing.
    #[error("storage quota exceeded")]
    QuotaExceeded,
    /// The backend itself failed (lock poisoned, I/O error).
    #[error("storage backend failure: {0}")]
    Backend(String),
    /// A value could not be encoded or decoded.
    #[error("storage serialization failure: {0}")]
    Serialization(String),
}

/// Raw string key/value storage contract.
///
/// Implementations are shared across the client, so every method takes
/// `&self` and synchronizes internally.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value. May fail with [`StorageError::QuotaExceeded`] when the
    /// backend is capacity-bound; callers decide how to recover.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn clear(&self) -> Result<(), StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-memory backend, optionally byte-capped.
///
/// The byte cap counts keys plus values and makes quota behavior testable
/// without a real constrained medium.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<HashMap<String, String>>>,
    max_bytes: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that rejects writes once `max_bytes` of keys + values is held.
    pub fn with_capacity(max_bytes: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_bytes: Some(max_bytes),
        }
    }

    fn used_bytes(data: &HashMap<String, String>) -> usize {
        data.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;

        if let Some(max_bytes) = self.max_bytes {
            let existing = data.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let projected = Self::used_bytes(&data) - existing + key.len() + value.len();
            if projected > max_bytes {
                return Err(StorageError::QuotaExceeded);
            }
        }

        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        data.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        data.clear();
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        Ok(data.keys().cloned().collect())
    }
}

/// File-backed backend holding the whole map in one JSON file.
///
/// Writes go through a temp file and rename so a crash mid-write never
/// leaves a truncated store behind. A corrupt or missing file reads as an
/// empty map.
#[derive(Clone)]
pub struct FileBackend {
    path: PathBuf,
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl FileBackend {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(map) => map,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "store file is corrupt; starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "store file unreadable; starting empty");
                HashMap::new()
            }
        };

        Self {
            path,
            data: Arc::new(RwLock::new(data)),
        }
    }

    fn flush(&self, data: &HashMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|err| StorageError::Backend(format!("create {}: {err}", parent.display())))?;
        }

        let encoded = serde_json::to_vec(data)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let temp_path = temp_path_for(&self.path);
        fs::write(&temp_path, encoded)
            .map_err(|err| StorageError::Backend(format!("write {}: {err}", temp_path.display())))?;

        if let Err(rename_err) = fs::rename(&temp_path, &self.path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(StorageError::Backend(format!(
                        "replace {} after rename error ({rename_err}): {err}",
                        self.path.display()
                    )));
                }
            }
            fs::rename(&temp_path, &self.path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                StorageError::Backend(format!("rename {}: {err}", self.path.display()))
            })?;
        }

        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("webchat-store.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        self.flush(&data)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        if data.remove(key).is_some() {
            self.flush(&data)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        data.clear();
        self.flush(&data)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        Ok(data.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn unique_temp_path(label: &str) -> PathBuf {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        env::temp_dir().join(format!("webchat-{label}-{now_nanos}.json"))
    }

    #[test]
    fn memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        backend.set("a", "1").expect("set should work");
        assert_eq!(backend.get("a").expect("get should work"), Some("1".to_owned()));

        backend.remove("a").expect("remove should work");
        assert_eq!(backend.get("a").expect("get should work"), None);
    }

    #[test]
    fn memory_backend_enforces_byte_cap() {
        let backend = MemoryBackend::with_capacity(8);
        backend.set("ab", "cd").expect("small write should fit");

        let err = backend
            .set("wide", "value-too-large")
            .expect_err("oversized write must fail");
        assert_eq!(err, StorageError::QuotaExceeded);

        // Replacing an existing value only counts the delta.
        backend.set("ab", "ef").expect("same-size replace should fit");
    }

    #[test]
    fn file_backend_round_trip_survives_reopen() {
        let path = unique_temp_path("backend");
        {
            let backend = FileBackend::open(&path);
            backend.set("k", "v").expect("set should work");
        }

        let reopened = FileBackend::open(&path);
        assert_eq!(
            reopened.get("k").expect("get should work"),
            Some("v".to_owned())
        );

        reopened.clear().expect("clear should work");
        assert!(reopened.keys().expect("keys should work").is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn file_backend_treats_corrupt_file_as_empty() {
        let path = unique_temp_path("corrupt");
        fs::write(&path, "{ not json").expect("write fixture");

        let backend = FileBackend::open(&path);
        assert_eq!(backend.get("k").expect("get should work"), None);
        let _ = fs::remove_file(&path);
    }
}
