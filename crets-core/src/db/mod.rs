//! Key-value backend abstraction
//!
//! This module provides a trait-based abstraction for the origin-scoped
//! key-value store the requirement data lives in, allowing the system to use
//! different stores (JSON file, SQLite, memory) behind one interface.

mod file_backend;
mod memory_backend;
mod sqlite_backend;
mod traits;

pub use file_backend::FileBackend;
pub use memory_backend::MemoryBackend;
pub use sqlite_backend::SqliteBackend;
pub use traits::{BackendType, KvBackend};
pub(crate) use traits::entry_size;

use std::path::Path;
use std::sync::Arc;

use crate::error::KvError;

/// Creates a backend based on the path or an explicit type
pub fn create_backend(
    path: &Path,
    backend_type: Option<BackendType>,
    quota: Option<usize>,
) -> Result<Arc<dyn KvBackend>, KvError> {
    let bt = backend_type.unwrap_or_else(|| BackendType::infer(path));

    let backend: Arc<dyn KvBackend> = match bt {
        BackendType::Memory => Arc::new(match quota {
            Some(limit) => MemoryBackend::with_quota(limit),
            None => MemoryBackend::new(),
        }),
        BackendType::File => Arc::new(FileBackend::open(path, quota)?),
        BackendType::Sqlite => Arc::new(SqliteBackend::open(path, quota)?),
    };
    backend.probe()?;
    log::debug!("opened {} store at {:?}", bt, path);
    Ok(backend)
}
