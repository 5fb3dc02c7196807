//! In-memory key-value backend
//!
//! Used by tests and as the session-only fallback when persistent storage
//! cannot be opened.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::traits::{check_quota, entry_size, BackendType, KvBackend};
use crate::error::KvError;

/// Process-local backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryBackend {
    /// Creates an empty, unbounded backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty backend that rejects writes beyond `quota` bytes
    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota: Some(quota),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        // A panic while holding the lock cannot leave the map half-written
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes currently counted against the quota
    pub fn used_bytes(&self) -> usize {
        self.entries()
            .iter()
            .map(|(k, v)| entry_size(k, v))
            .sum()
    }
}

impl KvBackend for MemoryBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries();
        let used: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        let old = entries.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
        check_quota(self.quota, used, old, entry_size(key, value))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.entries().remove(key);
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries().remove(key))
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        Ok(self.entries().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_basic_operations() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("a").unwrap(), None);

        backend.set("a", "1").unwrap();
        backend.set("b", "2").unwrap();
        assert_eq!(backend.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(backend.keys().unwrap(), vec!["a", "b"]);

        assert_eq!(backend.take("a").unwrap().as_deref(), Some("1"));
        assert_eq!(backend.take("a").unwrap(), None);

        backend.remove("b").unwrap();
        backend.remove("missing").unwrap();
        assert!(backend.keys().unwrap().is_empty());
    }

    #[test]
    fn test_memory_backend_quota() {
        let backend = MemoryBackend::with_quota(10);
        backend.set("k", "12345").unwrap();
        assert_eq!(backend.used_bytes(), 6);

        let err = backend.set("j", "123456").unwrap_err();
        assert!(matches!(err, KvError::QuotaExceeded { .. }));

        // Replacing an entry only counts the difference
        backend.set("k", "123456789").unwrap();
        assert_eq!(backend.used_bytes(), 10);
    }
}
