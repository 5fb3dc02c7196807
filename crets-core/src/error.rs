//! Error types for the requirement store
//!
//! Only `StorageUnavailable` is meant to reach the user as a hard failure;
//! everything else is recovered close to where it happens.

use thiserror::Error;

/// Errors raised by key-value backends
#[derive(Error, Debug)]
pub enum KvError {
    #[error("storage quota exceeded ({used} of {limit} bytes)")]
    QuotaExceeded { used: usize, limit: usize },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage file is not a valid key-value document: {0}")]
    Format(String),

    #[error("timed out waiting for storage lock")]
    LockTimeout,
}

/// Errors surfaced by the persistence adapter and the scoped store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store cannot be reached at all; the UI degrades to session-only state
    #[error("persistent storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Write still exceeded the quota after evicting auxiliary keys
    #[error("storage quota exceeded writing {key}")]
    QuotaExceeded { key: String },

    #[error("failed to write {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("corrupt payload under {key}: {reason}")]
    CorruptPayload { key: String, reason: String },

    #[error("no active work item scope")]
    ScopeUnresolved,

    #[error("pending batch is stale ({age_ms} ms old)")]
    StaleBatch { age_ms: i64 },

    #[error("requirement not found: {0}")]
    NotFound(String),

    #[error("invalid requirement: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Returns true for failures the store recovers from on its own
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::StorageUnavailable(_))
    }
}

/// Errors from a single fan-out channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(String),
}

/// Errors from the host platform collaborator
#[derive(Error, Debug)]
pub enum HostError {
    #[error("not running inside a work item form")]
    NoWorkItem,
}
