use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::BackendType;

/// Default age after which an unconsumed batch is discarded
pub const DEFAULT_STALE_AFTER_SECS: u64 = 5 * 60;
/// Default source tag stamped on published batches
pub const DEFAULT_SOURCE_TAG: &str = "CRETS4DevOps-Hub";

/// Runtime settings, loaded from a YAML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Path to the key-value store (".json", ".db" or ":memory:")
    pub store_path: PathBuf,
    /// Explicit backend type, otherwise inferred from `store_path`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendType>,
    /// Byte quota enforced on the store, mirroring browser storage limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<usize>,
    /// Pending batches older than this are discarded unconsumed
    pub stale_after_secs: u64,
    /// How often the pending-batch watcher polls the store
    pub poll_interval_ms: u64,
    /// Tag identifying this publisher on outgoing batches
    pub source_tag: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            backend: None,
            quota_bytes: None,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            poll_interval_ms: 1000,
            source_tag: DEFAULT_SOURCE_TAG.to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from the provided path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings file: {:?}", path.as_ref()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {:?}", path.as_ref()))
    }

    /// Loads settings from `path` if it exists, otherwise returns defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the settings to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(&self)?;

        // Ensure parent directories exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write settings to {:?}", path.as_ref()))?;

        Ok(())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// Gets the path to the settings file
pub fn get_settings_path() -> Result<PathBuf> {
    // Check if CRETS_CONFIG environment variable is set
    if let Ok(path) = std::env::var("CRETS_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    let config_dir = dirs::config_dir().context("Failed to determine config directory")?;
    Ok(config_dir.join("crets").join("config.yaml"))
}

/// Default store location: `<data dir>/crets/store.json`
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("crets"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("store.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.stale_after(), Duration::from_secs(300));
        assert_eq!(settings.source_tag, "CRETS4DevOps-Hub");
        assert!(settings.store_path.ends_with("store.json"));
    }

    #[test]
    fn test_partial_file_fills_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.yaml");
        fs::write(&path, "store_path: /tmp/x.db\nquota_bytes: 5242880\n")?;

        let settings = Settings::load(&path)?;
        assert_eq!(settings.store_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(settings.quota_bytes, Some(5_242_880));
        assert_eq!(settings.poll_interval_ms, 1000);
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("config.yaml");

        let settings = Settings {
            backend: Some(BackendType::Sqlite),
            stale_after_secs: 60,
            ..Settings::default()
        };
        settings.save(&path)?;

        let loaded = Settings::load_or_default(&path)?;
        assert_eq!(loaded, settings);

        let missing = Settings::load_or_default(dir.path().join("missing.yaml"))?;
        assert_eq!(missing, Settings::default());
        Ok(())
    }
}
