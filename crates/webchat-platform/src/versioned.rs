use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{StorageBackend, StorageError};

/// Namespace prefix applied to every key this store touches.
pub const STORE_PREFIX: &str = "weni:webchat:";

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Fraction of prefixed entries evicted when a write hits the quota.
const QUOTA_EVICTION_FRACTION: f64 = 0.25;

/// Versioned wrapper persisted around every value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub timestamp: u64,
    pub data: Value,
}

/// Hook applied to envelopes whose version differs from [`SCHEMA_VERSION`].
///
/// Receives the stored version and data; returns the migrated data, or
/// `None` to discard the entry.
pub type MigrationHook = Arc<dyn Fn(u32, Value) -> Option<Value> + Send + Sync>;

/// Key/value store over a raw backend with transparent namespacing,
/// versioned envelopes, and quota recovery.
///
/// Read failures never propagate: a value that cannot be parsed is logged
/// and treated as absent.
pub struct VersionedStore {
    backend: Box<dyn StorageBackend>,
    migration: MigrationHook,
}

impl VersionedStore {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            migration: Arc::new(|_, data| Some(data)),
        }
    }

    /// Replace the no-op migration hook.
    pub fn with_migration(mut self, migration: MigrationHook) -> Self {
        self.migration = migration;
        self
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(&prefixed(key)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(%key, error = %err, "store read failed");
                return None;
            }
        };

        let envelope = match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%key, error = %err, "stored envelope is unparseable; treating as absent");
                return None;
            }
        };

        let data = if envelope.version == SCHEMA_VERSION {
            envelope.data
        } else {
            debug!(%key, stored = envelope.version, current = SCHEMA_VERSION, "migrating envelope");
            (self.migration)(envelope.version, envelope.data)?
        };

        match serde_json::from_value(data) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%key, error = %err, "stored data does not match expected shape");
                None
            }
        }
    }

    /// Write a value. On quota exhaustion the oldest 25% of prefixed
    /// entries (by envelope timestamp) are evicted and the write retried
    /// once.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let envelope = Envelope {
            version: SCHEMA_VERSION,
            timestamp: now_ms(),
            data: serde_json::to_value(value)
                .map_err(|err| StorageError::Serialization(err.to_string()))?,
        };
        let raw = serde_json::to_string(&envelope)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        match self.backend.set(&prefixed(key), &raw) {
            Ok(()) => Ok(()),
            Err(StorageError::QuotaExceeded) => {
                warn!(%key, "storage quota exceeded; evicting oldest entries");
                self.evict_oldest()?;
                self.backend.set(&prefixed(key), &raw)
            }
            Err(err) => Err(err),
        }
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.backend.remove(&prefixed(key))
    }

    /// Remove every prefixed entry. Entries outside the namespace are left
    /// alone.
    pub fn clear(&self) -> Result<(), StorageError> {
        for key in self.backend.keys()? {
            if key.starts_with(STORE_PREFIX) {
                self.backend.remove(&key)?;
            }
        }
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        matches!(self.backend.get(&prefixed(key)), Ok(Some(_)))
    }

    /// Prefixed keys, with the namespace stripped.
    pub fn keys(&self) -> Vec<String> {
        match self.backend.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|key| key.strip_prefix(STORE_PREFIX).map(str::to_owned))
                .collect(),
            Err(err) => {
                warn!(error = %err, "store key listing failed");
                Vec::new()
            }
        }
    }

    pub fn size(&self) -> usize {
        self.keys().len()
    }

    fn evict_oldest(&self) -> Result<(), StorageError> {
        let mut stamped: Vec<(String, u64)> = self
            .backend
            .keys()?
            .into_iter()
            .filter(|key| key.starts_with(STORE_PREFIX))
            .map(|key| {
                let timestamp = self
                    .backend
                    .get(&key)
                    .ok()
                    .flatten()
                    .and_then(|raw| serde_json::from_str::<Envelope>(&raw).ok())
                    .map(|envelope| envelope.timestamp)
                    .unwrap_or(0);
                (key, timestamp)
            })
            .collect();

        if stamped.is_empty() {
            return Ok(());
        }

        stamped.sort_by_key(|(_, timestamp)| *timestamp);
        let evict_count = ((stamped.len() as f64 * QUOTA_EVICTION_FRACTION).ceil() as usize).max(1);
        for (key, _) in stamped.into_iter().take(evict_count) {
            debug!(%key, "evicting entry for quota recovery");
            self.backend.remove(&key)?;
        }
        Ok(())
    }
}

fn prefixed(key: &str) -> String {
    format!("{STORE_PREFIX}{key}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
