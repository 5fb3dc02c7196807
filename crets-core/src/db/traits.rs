//! Key-value backend traits
//!
//! This module defines the core trait that all storage backends must implement.
//! Values are opaque UTF-8 strings; JSON handling lives in [`crate::storage`].

use std::path::Path;

use crate::error::KvError;

/// Types of key-value backends available
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Process-local map, gone when the process exits
    Memory,
    /// Single JSON document on disk with advisory file locking
    File,
    /// SQLite database file
    Sqlite,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Memory => write!(f, "memory"),
            BackendType::File => write!(f, "JSON file"),
            BackendType::Sqlite => write!(f, "SQLite"),
        }
    }
}

impl BackendType {
    /// Infers the backend from a store path
    pub fn infer(path: &Path) -> Self {
        if path.as_os_str() == ":memory:" {
            return BackendType::Memory;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("db") | Some("sqlite") | Some("sqlite3") => BackendType::Sqlite,
            _ => BackendType::File,
        }
    }
}

/// Core trait for key-value backends
///
/// Mirrors the browser's origin-scoped storage: flat string keys, string
/// values, enumerable keys. Every operation is fallible.
pub trait KvBackend: Send + Sync {
    /// Returns the backend type
    fn backend_type(&self) -> BackendType;

    /// Reads the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Stores `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Removes `key`; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), KvError>;

    /// Removes `key` and returns its previous value in one atomic step.
    ///
    /// At most one concurrent caller observes `Some` for a given write.
    fn take(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Lists every stored key
    fn keys(&self) -> Result<Vec<String>, KvError>;

    /// Checks that the store is reachable
    fn probe(&self) -> Result<(), KvError> {
        self.keys().map(|_| ())
    }

    /// Returns true if `key` is present
    fn contains(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.get(key)?.is_some())
    }
}

/// Bytes a single entry counts against the quota
pub(crate) fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// Fails with `QuotaExceeded` if replacing an entry of `old_size` bytes by
/// one of `new_size` bytes would push `used` past `limit`.
pub(crate) fn check_quota(
    limit: Option<usize>,
    used: usize,
    old_size: usize,
    new_size: usize,
) -> Result<(), KvError> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let after = used.saturating_sub(old_size) + new_size;
    if after > limit {
        return Err(KvError::QuotaExceeded { used: after, limit });
    }
    Ok(())
}
