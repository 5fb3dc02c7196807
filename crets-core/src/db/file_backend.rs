//! JSON file key-value backend
//!
//! Stores every key in a single JSON object file. A sibling lock file
//! guarded with `fs2` gives rudimentary multi-process safety: shared locks
//! for reads, exclusive locks for anything that writes.

use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::traits::{check_quota, entry_size, BackendType, KvBackend};
use crate::error::KvError;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(100);

type Document = BTreeMap<String, String>;

/// JSON file backend
pub struct FileBackend {
    file_path: PathBuf,
    lock_file_path: PathBuf,
    quota: Option<usize>,
}

impl FileBackend {
    /// Opens (creating if needed) the store file at `path`.
    ///
    /// A document that no longer parses is moved aside to
    /// `<name>.corrupt-<epoch-ms>` and replaced by an empty store.
    pub fn open<P: AsRef<Path>>(path: P, quota: Option<usize>) -> Result<Self, KvError> {
        let file_path = path.as_ref().to_path_buf();
        let lock_file_path = file_path.with_extension("json.lock");

        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let backend = Self {
            file_path,
            lock_file_path,
            quota,
        };

        let lock = backend.acquire_lock(true)?;
        if backend.file_path.exists() {
            if let Err(e) = backend.read_document() {
                let aside = backend.file_path.with_extension(format!(
                    "corrupt-{}",
                    chrono::Utc::now().timestamp_millis()
                ));
                log::warn!(
                    "store file {:?} unreadable ({}), moving it to {:?}",
                    backend.file_path,
                    e,
                    aside
                );
                fs::rename(&backend.file_path, &aside)?;
                backend.write_document(&Document::new())?;
            }
        } else {
            backend.write_document(&Document::new())?;
        }
        drop(lock);

        Ok(backend)
    }

    /// Returns the path to the store file
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Acquire a lock on the sibling lock file, retrying until the timeout
    fn acquire_lock(&self, exclusive: bool) -> Result<File, KvError> {
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_file_path)?;

        let start = Instant::now();
        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(&lock_file)
            } else {
                FileExt::try_lock_shared(&lock_file)
            };
            match attempt {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        return Err(KvError::LockTimeout);
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(KvError::Io(e)),
            }
        }
    }

    fn read_document(&self) -> Result<Document, KvError> {
        if !self.file_path.exists() {
            return Ok(Document::new());
        }
        let file = File::open(&self.file_path)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| KvError::Format(e.to_string()))
    }

    /// Writes through a temporary file so readers never see a torn document
    fn write_document(&self, doc: &Document) -> Result<(), KvError> {
        let tmp_path = self.file_path.with_extension("json.tmp");
        let json = serde_json::to_string(doc).map_err(|e| KvError::Format(e.to_string()))?;
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.file_path)?;
        Ok(())
    }

    /// Perform a read-modify-write under the exclusive lock
    fn update<T, F>(&self, update_fn: F) -> Result<T, KvError>
    where
        F: FnOnce(&mut Document) -> Result<(T, bool), KvError>,
    {
        let _lock = self.acquire_lock(true)?;
        let mut doc = self.read_document()?;
        let (out, changed) = update_fn(&mut doc)?;
        if changed {
            self.write_document(&doc)?;
        }
        Ok(out)
    }
}

impl KvBackend for FileBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::File
    }

    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let _lock = self.acquire_lock(false)?;
        Ok(self.read_document()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let quota = self.quota;
        self.update(|doc| {
            let used: usize = doc.iter().map(|(k, v)| entry_size(k, v)).sum();
            let old = doc.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
            check_quota(quota, used, old, entry_size(key, value))?;
            doc.insert(key.to_string(), value.to_string());
            Ok(((), true))
        })
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.update(|doc| {
            let changed = doc.remove(key).is_some();
            Ok(((), changed))
        })
    }

    fn take(&self, key: &str) -> Result<Option<String>, KvError> {
        self.update(|doc| {
            let previous = doc.remove(key);
            let changed = previous.is_some();
            Ok((previous, changed))
        })
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        let _lock = self.acquire_lock(false)?;
        Ok(self.read_document()?.into_keys().collect())
    }
}
