//! Shared sustainability requirement catalog
//!
//! The catalog is one JSON array stored under [`CATALOG_KEY`]. It is seeded
//! with a small built-in set on first use and edited from the catalog
//! context; work items only ever receive copies of its entries.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::bridge::now_ms;
use crate::error::StoreError;
use crate::hierarchy::descendants;
use crate::models::{ids_match, normalize_id, Requirement};
use crate::storage::{Persistence, BACKUP_KEY_PREFIX};

/// Store key of the catalog
pub const CATALOG_KEY: &str = "sustainabilityRequirements";

const DEFAULT_CATALOG: &str = include_str!("default_catalog.json");

/// Built-in entries used to seed an empty store
pub fn default_catalog() -> Vec<Requirement> {
    match serde_json::from_str(DEFAULT_CATALOG) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("built-in catalog is invalid: {}", e);
            Vec::new()
        }
    }
}

/// Checks every entry and rejects duplicate identifiers
pub fn validate_entries(entries: &[Requirement]) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    for entry in entries {
        entry.validate().map_err(StoreError::Invalid)?;
        if !seen.insert(normalize_id(&entry.id)) {
            return Err(StoreError::Invalid(format!("duplicate id {}", entry.id)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Catalog {
    persistence: Persistence,
}

impl Catalog {
    pub fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }

    /// All catalog entries, seeding the built-in set when none are stored
    pub fn load(&self) -> Vec<Requirement> {
        if let Some(entries) = self.persistence.get::<Vec<Requirement>>(CATALOG_KEY) {
            return entries;
        }

        let seed = default_catalog();
        log::info!("catalog empty, seeding {} built-in requirements", seed.len());
        if let Err(e) = self.persistence.set(CATALOG_KEY, &seed) {
            log::warn!("failed to store seeded catalog: {}", e);
        }
        seed
    }

    pub fn get(&self, id: &str) -> Option<Requirement> {
        self.load().into_iter().find(|r| r.is(id))
    }

    /// Replaces the whole catalog, keeping a backup of the previous one
    pub fn replace(&self, entries: &[Requirement]) -> Result<(), StoreError> {
        validate_entries(entries)?;
        self.backup();
        self.persistence.set(CATALOG_KEY, entries)?;
        log::info!("catalog replaced with {} entries", entries.len());
        Ok(())
    }

    /// Replaces the catalog with the JSON array in `path`
    pub fn import_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read catalog file: {:?}", path.as_ref()))?;
        let entries: Vec<Requirement> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog file: {:?}", path.as_ref()))?;

        self.replace(&entries)
            .with_context(|| format!("Failed to import {:?}", path.as_ref()))?;
        Ok(entries.len())
    }

    /// Adds a new entry and links it into its parent's child list
    pub fn create(&self, requirement: Requirement) -> Result<(), StoreError> {
        requirement.validate().map_err(StoreError::Invalid)?;

        let mut entries = self.load();
        if entries.iter().any(|r| r.is(&requirement.id)) {
            return Err(StoreError::Invalid(format!(
                "id {} already exists",
                requirement.id
            )));
        }

        if let Some(parent_id) = requirement.parent_id.as_deref() {
            if let Some(parent) = entries.iter_mut().find(|r| r.is(parent_id)) {
                let children = parent.children.get_or_insert_with(Vec::new);
                if !children.iter().any(|c| requirement.is(c)) {
                    children.push(requirement.id.clone());
                }
            }
        }

        log::info!("catalog entry {} created", requirement.id);
        entries.push(requirement);
        self.persistence.set(CATALOG_KEY, &entries)
    }

    /// Replaces the entry with the same id
    pub fn update(&self, requirement: Requirement) -> Result<(), StoreError> {
        requirement.validate().map_err(StoreError::Invalid)?;

        let mut entries = self.load();
        let slot = entries
            .iter_mut()
            .find(|r| r.is(&requirement.id))
            .ok_or_else(|| StoreError::NotFound(requirement.id.clone()))?;
        *slot = requirement;

        self.persistence.set(CATALOG_KEY, &entries)
    }

    /// Removes `id` and everything below it. Returns the removed ids.
    pub fn delete(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.load();
        let root = entries
            .iter()
            .find(|r| r.is(id))
            .map(|r| r.id.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut doomed = vec![root.clone()];
        doomed.extend(descendants(&root, &entries));

        let is_doomed = |candidate: &str| doomed.iter().any(|d| ids_match(d, candidate));
        let kept: Vec<Requirement> = entries
            .iter()
            .filter(|r| !is_doomed(&r.id))
            .cloned()
            .map(|mut r| {
                if let Some(children) = r.children.as_mut() {
                    children.retain(|c| !is_doomed(c));
                }
                r
            })
            .collect();

        self.backup();
        self.persistence.set(CATALOG_KEY, &kept)?;
        log::info!(
            "catalog entry {} deleted with {} descendants",
            root,
            doomed.len() - 1
        );
        Ok(doomed)
    }

    /// Catalog entries for `ids` in the requested order, without duplicates
    pub fn select(&self, ids: &[String]) -> Result<Vec<Requirement>, StoreError> {
        if ids.is_empty() {
            return Err(StoreError::Invalid("no requirements selected".to_string()));
        }

        let entries = self.load();
        let mut selected: Vec<Requirement> = Vec::new();
        for id in ids {
            let entry = entries
                .iter()
                .find(|r| r.is(id))
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if !selected.iter().any(|s| s.is(&entry.id)) {
                selected.push(entry.clone());
            }
        }
        Ok(selected)
    }

    fn backup(&self) {
        let Some(current) = self.persistence.get_raw(CATALOG_KEY) else {
            return;
        };
        let key = format!("{}catalog_{}", BACKUP_KEY_PREFIX, now_ms());
        match self.persistence.set_raw(&key, &current) {
            Ok(()) => log::debug!("catalog backed up to {}", key),
            Err(e) => log::warn!("catalog backup skipped: {}", e),
        }
    }
}
