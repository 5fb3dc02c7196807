//! Key-value persistence adapter
//!
//! Typed JSON access on top of a [`KvBackend`]. Reads never fail: a missing
//! key, an unreachable backend and a corrupt payload all read as absent, and
//! a corrupt payload is deleted on the way out. Writes report failures.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::config::Settings;
use crate::db::{create_backend, entry_size, BackendType, KvBackend, MemoryBackend};
use crate::error::{KvError, StoreError};

/// Singleton key holding the pending-batch metadata
pub const PENDING_KEY: &str = "requirements_pending";
/// Prefix of pending-batch payload keys (`pending_requirements_<epoch-ms>`)
pub const PENDING_PAYLOAD_PREFIX: &str = "pending_requirements_";
/// Prefix of keys derived while no scope was set
pub const TEMP_KEY_PREFIX: &str = "temp_";
/// Prefix of backup copies written before destructive catalog changes
pub const BACKUP_KEY_PREFIX: &str = "backup_";

/// Result of inspecting a key without healing it
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T> {
    Absent,
    Valid(T),
    Corrupt(String),
}

impl<T> Payload<T> {
    /// Treats a corrupt payload under `key` as an error
    pub fn into_result(self, key: &str) -> Result<Option<T>, StoreError> {
        match self {
            Payload::Absent => Ok(None),
            Payload::Valid(value) => Ok(Some(value)),
            Payload::Corrupt(reason) => Err(StoreError::CorruptPayload {
                key: key.to_string(),
                reason,
            }),
        }
    }
}

/// Whether data written now outlives the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Persistent(BackendType),
    /// Persistent storage could not be opened; data lives only in memory
    SessionOnly { reason: String },
}

impl Availability {
    pub fn is_persistent(&self) -> bool {
        matches!(self, Availability::Persistent(_))
    }

    /// Banner text for the session-only case
    pub fn banner(&self) -> Option<String> {
        match self {
            Availability::Persistent(_) => None,
            Availability::SessionOnly { reason } => Some(format!(
                "Persistent storage is unavailable ({}). Changes will be lost when this session ends.",
                reason
            )),
        }
    }
}

/// JSON persistence over a shared key-value backend
#[derive(Clone)]
pub struct Persistence {
    backend: Arc<dyn KvBackend>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("backend", &self.backend.backend_type())
            .finish()
    }
}

impl Persistence {
    /// Wraps an existing backend
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Creates a persistence layer over a fresh in-memory backend
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Opens the backend described by `settings`
    pub fn open(settings: &Settings) -> Result<Self, StoreError> {
        create_backend(&settings.store_path, settings.backend, settings.quota_bytes)
            .map(Self::new)
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))
    }

    /// Opens the configured backend, degrading to session-only memory storage
    pub fn open_or_session(settings: &Settings) -> (Self, Availability) {
        match Self::open(settings) {
            Ok(persistence) => {
                let bt = persistence.backend_type();
                (persistence, Availability::Persistent(bt))
            }
            Err(e) => {
                log::error!("{}; falling back to session-only storage", e);
                (
                    Self::memory(),
                    Availability::SessionOnly {
                        reason: e.to_string(),
                    },
                )
            }
        }
    }

    /// Returns the backend type
    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    /// Returns the shared backend handle
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Reads the raw string stored under `key`
    pub fn get_raw(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                log::error!("failed to read {}: {}", key, e);
                None
            }
        }
    }

    /// Reads and deserializes `key`, deleting it if the payload is corrupt
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.inspect(key).into_result(key) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("{}, removing it", e);
                if let Err(e) = self.remove(key) {
                    log::error!("failed to remove corrupt key {}: {}", key, e);
                }
                None
            }
        }
    }

    /// Reads `key` without healing it
    pub fn inspect<T: DeserializeOwned>(&self, key: &str) -> Payload<T> {
        match self.get_raw(key) {
            None => Payload::Absent,
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Payload::Valid(value),
                Err(e) => Payload::Corrupt(e.to_string()),
            },
        }
    }

    /// Serializes and stores `value` under `key`
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value).map_err(|e| StoreError::WriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set_raw(key, &json)
    }

    /// Stores a raw string under `key`.
    ///
    /// A quota failure evicts auxiliary keys and retries exactly once.
    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_raw_protecting(key, value, &[])
    }

    /// Like [`Persistence::set`], but quota eviction never drops `protect`
    pub fn set_protecting<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        protect: &[&str],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(value).map_err(|e| StoreError::WriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set_raw_protecting(key, &json, protect)
    }

    /// Like [`Persistence::set_raw`], but quota eviction never drops `protect`
    pub fn set_raw_protecting(
        &self,
        key: &str,
        value: &str,
        protect: &[&str],
    ) -> Result<(), StoreError> {
        match self.backend.set(key, value) {
            Ok(()) => Ok(()),
            Err(KvError::QuotaExceeded { used, limit }) => {
                let mut keep = protect.to_vec();
                keep.push(key);
                let evicted = self.evict_auxiliary(&keep, used.saturating_sub(limit));
                log::warn!(
                    "quota exceeded writing {}; evicted {} auxiliary keys, retrying",
                    key,
                    evicted
                );
                match self.backend.set(key, value) {
                    Ok(()) => Ok(()),
                    Err(KvError::QuotaExceeded { .. }) => {
                        log::error!("quota still exceeded writing {}", key);
                        Err(StoreError::QuotaExceeded {
                            key: key.to_string(),
                        })
                    }
                    Err(e) => Err(write_failed(key, e)),
                }
            }
            Err(e) => Err(write_failed(key, e)),
        }
    }

    /// Removes `key`
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.backend.remove(key).map_err(|e| write_failed(key, e))
    }

    /// Atomically removes `key` and returns its deserialized value.
    ///
    /// The key is gone afterwards whether or not the payload parsed.
    pub fn take<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.take(key) {
            Ok(raw) => raw?,
            Err(e) => {
                log::error!("failed to take {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("discarded corrupt payload taken from {}: {}", key, e);
                None
            }
        }
    }

    /// Lists every stored key
    pub fn keys(&self) -> Vec<String> {
        match self.backend.keys() {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("failed to list keys: {}", e);
                Vec::new()
            }
        }
    }

    /// Evicts auxiliary keys oldest first until `needed` bytes are freed.
    ///
    /// Keys in `protect` and the payload referenced by the live pending
    /// record are never evicted.
    fn evict_auxiliary(&self, protect: &[&str], needed: usize) -> usize {
        let referenced = self
            .get_raw(PENDING_KEY)
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|v| {
                v.get("batchKey")
                    .or_else(|| v.get("key"))
                    .and_then(|k| k.as_str())
                    .map(str::to_string)
            });

        let mut candidates: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|k| is_auxiliary_key(k))
            .filter(|k| !protect.contains(&k.as_str()) && Some(k) != referenced.as_ref())
            .collect();
        candidates.sort_by_key(|k| key_timestamp(k));

        let mut freed = 0;
        let mut evicted = 0;
        for key in candidates {
            if freed >= needed {
                break;
            }
            let size = self
                .get_raw(&key)
                .map(|value| entry_size(&key, &value))
                .unwrap_or(0);
            match self.backend.remove(&key) {
                Ok(()) => {
                    log::info!("evicted auxiliary key {} ({} bytes)", key, size);
                    freed += size;
                    evicted += 1;
                }
                Err(e) => log::warn!("failed to evict {}: {}", key, e),
            }
        }
        evicted
    }
}

fn write_failed(key: &str, e: KvError) -> StoreError {
    log::error!("failed to write {}: {}", key, e);
    StoreError::WriteFailed {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

/// Keys that may be dropped to make room for scoped data
pub fn is_auxiliary_key(key: &str) -> bool {
    key.starts_with(TEMP_KEY_PREFIX)
        || key.starts_with(BACKUP_KEY_PREFIX)
        || key.starts_with(PENDING_PAYLOAD_PREFIX)
}

/// Trailing `_<epoch-ms>` of a generated key; keys without one sort first
fn key_timestamp(key: &str) -> i64 {
    key.rsplit('_')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn with_quota(limit: usize) -> Persistence {
        Persistence::new(Arc::new(MemoryBackend::with_quota(limit)))
    }

    #[test]
    fn test_get_set_remove() {
        let p = Persistence::memory();
        assert_eq!(p.get::<Vec<String>>("ids"), None);

        p.set("ids", &vec!["A".to_string()]).unwrap();
        assert_eq!(p.get::<Vec<String>>("ids"), Some(vec!["A".to_string()]));

        p.remove("ids").unwrap();
        assert_eq!(p.get::<Vec<String>>("ids"), None);
    }

    #[test]
    fn test_corrupt_read_self_heals() {
        let p = Persistence::memory();
        p.set_raw("workitem_5_selectedRequirements", "[{broken").unwrap();

        assert!(matches!(
            p.inspect::<Vec<String>>("workitem_5_selectedRequirements"),
            Payload::Corrupt(_)
        ));
        // inspect does not heal
        assert!(p.get_raw("workitem_5_selectedRequirements").is_some());

        assert_eq!(p.get::<Vec<String>>("workitem_5_selectedRequirements"), None);
        assert_eq!(p.get_raw("workitem_5_selectedRequirements"), None);
    }

    #[test]
    fn test_take_removes_even_when_corrupt() {
        let p = Persistence::memory();
        p.set_raw("requirements_pending", "nope").unwrap();
        assert_eq!(p.take::<serde_json::Value>("requirements_pending"), None);
        assert!(p.keys().is_empty());
    }

    #[test]
    fn test_quota_evicts_oldest_auxiliary_keys_until_write_fits() {
        let p = with_quota(200);
        p.set_raw("temp_selectedRequirements_100", &"x".repeat(30)).unwrap();
        p.set_raw("pending_requirements_200", &"y".repeat(30)).unwrap();
        p.set_raw("workitem_1_selectedRequirements", "[]").unwrap();

        // 37 bytes over the limit; the oldest key alone frees 59
        p.set_raw("workitem_2_selectedRequirements", &"z".repeat(60))
            .unwrap();

        let keys = p.keys();
        assert!(keys.contains(&"workitem_1_selectedRequirements".to_string()));
        assert!(keys.contains(&"workitem_2_selectedRequirements".to_string()));
        assert!(!keys.contains(&"temp_selectedRequirements_100".to_string()));
        assert!(keys.contains(&"pending_requirements_200".to_string()));
    }

    #[test]
    fn test_quota_eviction_spares_protected_keys() {
        let p = with_quota(150);
        p.set_raw("backup_catalog_100", &"b".repeat(30)).unwrap();
        p.set_raw("pending_requirements_50", &"p".repeat(40)).unwrap();

        p.set_raw_protecting(
            "workitem_1_selectedRequirements",
            &"z".repeat(50),
            &["pending_requirements_50"],
        )
        .unwrap();

        let keys = p.keys();
        assert!(keys.contains(&"pending_requirements_50".to_string()));
        assert!(!keys.contains(&"backup_catalog_100".to_string()));
    }

    #[test]
    fn test_payload_into_result_reports_corruption() {
        let p = Persistence::memory();
        p.set_raw("workitem_3_removedRequirements", "{oops").unwrap();

        let err = p
            .inspect::<Vec<String>>("workitem_3_removedRequirements")
            .into_result("workitem_3_removedRequirements")
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptPayload { ref key, .. }
            if key == "workitem_3_removedRequirements"));
        assert_eq!(
            p.inspect::<Vec<String>>("absent").into_result("absent").unwrap(),
            None
        );
    }

    #[test]
    fn test_quota_eviction_spares_referenced_payload() {
        let p = with_quota(170);
        p.set_raw("pending_requirements_200", &"y".repeat(30)).unwrap();
        p.set_raw(
            PENDING_KEY,
            r#"{"batchKey":"pending_requirements_200","count":1,"timestamp":200,"sourceTag":"t"}"#,
        )
        .unwrap();

        let err = p
            .set_raw("workitem_1_selectedRequirements", &"z".repeat(100))
            .unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert!(p.get_raw("pending_requirements_200").is_some());
    }

    #[test]
    fn test_open_or_session_degrades() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let settings = Settings {
            store_path: blocker.join("store.json"),
            ..Settings::default()
        };
        let (p, availability) = Persistence::open_or_session(&settings);
        assert!(!availability.is_persistent());
        assert!(availability.banner().is_some());
        assert_eq!(p.backend_type(), BackendType::Memory);

        let ok = Settings {
            store_path: PathBuf::from(":memory:"),
            ..Settings::default()
        };
        let (_, availability) = Persistence::open_or_session(&ok);
        assert_eq!(availability, Availability::Persistent(BackendType::Memory));
    }

    #[test]
    fn test_key_timestamp() {
        assert_eq!(key_timestamp("pending_requirements_1700000000000"), 1_700_000_000_000);
        assert_eq!(key_timestamp("backup_catalog"), 0);
    }
}
