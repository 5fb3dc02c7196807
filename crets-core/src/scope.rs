//! Per-work-item namespaced store
//!
//! Every work item keeps its applied requirements and removed identifiers
//! under its own keys (`workitem_<scope>_<logical>`). Switching scope never
//! touches data; scopes are disjoint by construction.

use std::collections::BTreeSet;

use chrono::Utc;

use crate::error::StoreError;
use crate::models::{ids_match, normalize_id, Requirement};
use crate::storage::{Persistence, TEMP_KEY_PREFIX};

/// Prefix of every scoped key
pub const WORKITEM_KEY_PREFIX: &str = "workitem_";
/// Logical name of the applied-requirement list
pub const APPLIED_KEY: &str = "selectedRequirements";
/// Logical name of the removed-identifier list
pub const REMOVED_KEY: &str = "removedRequirementIds";

/// Key prefixes left behind by early builds that shared data between items
const LEGACY_PREFIXES: [&str; 4] = [
    "default_",
    "workitem_dev_12345_",
    "workitem_null_",
    "workitem_undefined_",
];

/// Builds the storage key for `logical` under `scope`
pub fn scope_key(scope: &str, logical: &str) -> String {
    format!("{}{}_{}", WORKITEM_KEY_PREFIX, scope, logical)
}

/// Splits a scoped key into `(scope, logical)`.
///
/// Scope identifiers may contain `_` (temporary ids do), so only the known
/// logical names are recognized.
pub fn parse_scoped_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(WORKITEM_KEY_PREFIX)?;
    [APPLIED_KEY, REMOVED_KEY].into_iter().find_map(|logical| {
        let scope = rest.strip_suffix(logical)?.strip_suffix('_')?;
        (!scope.is_empty()).then_some((scope, logical))
    })
}

/// Diagnostic summary of how the store is partitioned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndependenceReport {
    pub scope: String,
    pub own_keys: Vec<String>,
    pub other_keys: usize,
    pub scopes: usize,
}

/// What `migrate_scope` moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationReport {
    /// Applied requirements now under the new scope that came from the old one
    pub applied: usize,
    /// Removed identifiers carried over
    pub removed: usize,
}

/// Store bound to one work item at a time
#[derive(Debug, Clone)]
pub struct ScopedStore {
    persistence: Persistence,
    scope: Option<String>,
}

impl ScopedStore {
    /// Creates a store with no scope yet
    pub fn new(persistence: Persistence) -> Self {
        Self {
            persistence,
            scope: None,
        }
    }

    /// Creates a store already bound to `scope`
    pub fn with_scope(persistence: Persistence, scope: &str) -> Self {
        let mut store = Self::new(persistence);
        store.set_scope(scope);
        store
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Switches to `scope`. Returns false if it was already active.
    pub fn set_scope(&mut self, scope: &str) -> bool {
        if self.scope.as_deref() == Some(scope) {
            return false;
        }
        log::info!(
            "switching work item scope {:?} -> {:?}",
            self.scope.as_deref().unwrap_or("<unset>"),
            scope
        );
        self.scope = Some(scope.to_string());
        true
    }

    /// Derives the storage key for `logical` in the active scope.
    ///
    /// Without a scope the key is a throwaway `temp_<logical>_<epoch-ms>`;
    /// whatever is written there is orphaned.
    pub fn derive_key(&self, logical: &str) -> String {
        match self.scope.as_deref() {
            Some(scope) => {
                let key = scope_key(scope, logical);
                log::debug!("derived key {}", key);
                key
            }
            None => {
                let key = format!(
                    "{}{}_{}",
                    TEMP_KEY_PREFIX,
                    logical,
                    Utc::now().timestamp_millis()
                );
                log::warn!("{}; using temporary key {}", StoreError::ScopeUnresolved, key);
                key
            }
        }
    }

    /// Applied requirements of the active scope; empty when absent or corrupt
    pub fn get_applied(&self) -> Vec<Requirement> {
        let key = self.derive_key(APPLIED_KEY);
        let applied: Vec<Requirement> = self.persistence.get(&key).unwrap_or_default();
        log::debug!("{} applied requirements under {}", applied.len(), key);
        applied
    }

    /// Replaces the applied list of the active scope.
    ///
    /// Duplicate identifiers keep their first occurrence.
    pub fn set_applied(&self, requirements: &[Requirement]) -> Result<(), StoreError> {
        let key = self.derive_key(APPLIED_KEY);
        let unique = dedupe(requirements);
        if unique.len() != requirements.len() {
            log::warn!(
                "dropped {} duplicate requirement ids writing {}",
                requirements.len() - unique.len(),
                key
            );
        }
        self.persistence.set(&key, &unique)
    }

    /// Removed identifiers of the active scope
    pub fn get_removed(&self) -> Vec<String> {
        let key = self.derive_key(REMOVED_KEY);
        self.persistence.get(&key).unwrap_or_default()
    }

    /// Replaces the removed-identifier list of the active scope
    pub fn set_removed(&self, ids: &[String]) -> Result<(), StoreError> {
        let key = self.derive_key(REMOVED_KEY);
        self.persistence.set(&key, ids)
    }

    /// Applied minus removed
    pub fn visible(&self) -> Vec<Requirement> {
        let removed = self.get_removed();
        self.get_applied()
            .into_iter()
            .filter(|r| !crate::hierarchy::is_removed(&removed, &r.id))
            .collect()
    }

    /// Checks that this scope's data is its own and readable.
    ///
    /// Returns false when no scope is set, when another stored key resolves
    /// to this scope, or when this scope's payload is corrupt; a corrupt
    /// payload of this scope is deleted. Other scopes' keys are never touched.
    pub fn verify_isolation(&self) -> bool {
        let Some(scope) = self.scope.as_deref() else {
            log::warn!("cannot verify isolation: {}", StoreError::ScopeUnresolved);
            return false;
        };

        let mut independent = true;
        let own_keys = [scope_key(scope, APPLIED_KEY), scope_key(scope, REMOVED_KEY)];

        for key in self.persistence.keys() {
            if own_keys.contains(&key) {
                continue;
            }
            if let Some((other_scope, _)) = parse_scoped_key(&key) {
                if ids_match(other_scope, scope) {
                    log::warn!("key {} collides with scope {}", key, scope);
                    independent = false;
                }
            }
        }

        let [applied_key, removed_key] = own_keys;
        let checks = [
            (
                &applied_key,
                self.persistence
                    .inspect::<Vec<Requirement>>(&applied_key)
                    .into_result(&applied_key)
                    .map(|_| ()),
            ),
            (
                &removed_key,
                self.persistence
                    .inspect::<Vec<String>>(&removed_key)
                    .into_result(&removed_key)
                    .map(|_| ()),
            ),
        ];
        for (key, check) in checks {
            if let Err(e) = check {
                log::error!("scope {}: {}, clearing it", scope, e);
                self.remove_own(key);
                independent = false;
            }
        }

        independent
    }

    fn remove_own(&self, key: &str) {
        if let Err(e) = self.persistence.remove(key) {
            log::error!("failed to clear {}: {}", key, e);
        }
    }

    /// Summarizes which scoped keys exist
    pub fn independence_report(&self) -> Option<IndependenceReport> {
        let scope = self.scope.clone()?;
        let mut own_keys = Vec::new();
        let mut other_keys = 0;
        let mut scopes = BTreeSet::new();

        for key in self.persistence.keys() {
            if let Some((key_scope, _)) = parse_scoped_key(&key) {
                scopes.insert(key_scope.to_string());
                if key_scope == scope {
                    own_keys.push(key);
                } else {
                    other_keys += 1;
                }
            }
        }

        Some(IndependenceReport {
            scope,
            own_keys,
            other_keys,
            scopes: scopes.len(),
        })
    }

    /// Deletes keys written by early builds under shared scopes.
    /// Returns how many were removed.
    pub fn cleanup_legacy_keys(&self) -> usize {
        let mut cleaned = 0;
        for key in self.persistence.keys() {
            if LEGACY_PREFIXES.iter().any(|p| key.starts_with(p)) {
                match self.persistence.remove(&key) {
                    Ok(()) => {
                        log::info!("removed legacy key {}", key);
                        cleaned += 1;
                    }
                    Err(e) => log::warn!("failed to remove legacy key {}: {}", key, e),
                }
            }
        }
        cleaned
    }

    /// Moves a scope's data to a new identifier (temporary -> permanent).
    ///
    /// Data already under `new` is kept; entries from `old` are merged in
    /// without duplicating identifiers. Old keys are deleted only after both
    /// writes succeed. If `old` is the active scope, `new` becomes active.
    pub fn migrate_scope(&mut self, old: &str, new: &str) -> Result<MigrationReport, StoreError> {
        if old == new {
            return Ok(MigrationReport::default());
        }

        let old_applied_key = scope_key(old, APPLIED_KEY);
        let old_removed_key = scope_key(old, REMOVED_KEY);
        let new_applied_key = scope_key(new, APPLIED_KEY);
        let new_removed_key = scope_key(new, REMOVED_KEY);

        let old_applied: Option<Vec<Requirement>> = self.persistence.get(&old_applied_key);
        let old_removed: Option<Vec<String>> = self.persistence.get(&old_removed_key);
        let mut report = MigrationReport::default();

        if let Some(old_applied) = old_applied {
            let mut merged: Vec<Requirement> =
                self.persistence.get(&new_applied_key).unwrap_or_default();
            for req in old_applied {
                if !merged.iter().any(|m| m.is(&req.id)) {
                    merged.push(req);
                    report.applied += 1;
                }
            }
            self.persistence.set(&new_applied_key, &merged)?;
        }

        if let Some(old_removed) = old_removed {
            let mut merged: Vec<String> =
                self.persistence.get(&new_removed_key).unwrap_or_default();
            for id in old_removed {
                if !crate::hierarchy::is_removed(&merged, &id) {
                    merged.push(id);
                    report.removed += 1;
                }
            }
            self.persistence.set(&new_removed_key, &merged)?;
        }

        self.persistence.remove(&old_applied_key)?;
        self.persistence.remove(&old_removed_key)?;

        if self.scope.as_deref() == Some(old) {
            self.scope = Some(new.to_string());
        }

        log::info!(
            "migrated scope {} -> {} ({} applied, {} removed ids)",
            old,
            new,
            report.applied,
            report.removed
        );
        Ok(report)
    }
}

/// Keeps the first occurrence of every normalized identifier
fn dedupe(requirements: &[Requirement]) -> Vec<&Requirement> {
    let mut seen = BTreeSet::new();
    requirements
        .iter()
        .filter(|r| seen.insert(normalize_id(&r.id).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reqs(ids: &[&str]) -> Vec<Requirement> {
        ids.iter().map(|id| Requirement::new(*id, format!("detail {}", id))).collect()
    }

    fn ids(reqs: &[Requirement]) -> Vec<&str> {
        reqs.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_scope_key_layout() {
        assert_eq!(scope_key("42", APPLIED_KEY), "workitem_42_selectedRequirements");
        assert_eq!(scope_key("42", REMOVED_KEY), "workitem_42_removedRequirementIds");
        assert_eq!(
            parse_scoped_key("workitem_new_1700_ab12cd34_selectedRequirements"),
            Some(("new_1700_ab12cd34", APPLIED_KEY))
        );
        assert_eq!(parse_scoped_key("workitem__selectedRequirements"), None);
        assert_eq!(parse_scoped_key("workitem_42_other"), None);
        assert_eq!(parse_scoped_key("requirements_pending"), None);
    }

    #[test]
    fn test_set_scope_is_idempotent() {
        let mut store = ScopedStore::new(Persistence::memory());
        assert!(store.set_scope("1"));
        assert!(!store.set_scope("1"));
        assert!(store.set_scope("2"));
        assert_eq!(store.scope(), Some("2"));
    }

    #[test]
    fn test_unscoped_keys_are_temporary() {
        let store = ScopedStore::new(Persistence::memory());
        assert!(store.derive_key(APPLIED_KEY).starts_with("temp_selectedRequirements_"));
        assert!(store.get_applied().is_empty());
        assert!(!store.verify_isolation());
        assert!(store.independence_report().is_none());
    }

    #[test]
    fn test_scope_isolation() {
        let persistence = Persistence::memory();
        let a = ScopedStore::with_scope(persistence.clone(), "100");
        let b = ScopedStore::with_scope(persistence.clone(), "200");

        a.set_applied(&reqs(&["A.1", "A.2"])).unwrap();
        b.set_applied(&reqs(&["B.1"])).unwrap();
        a.set_removed(&["A.2".to_string()]).unwrap();

        assert_eq!(ids(&a.get_applied()), vec!["A.1", "A.2"]);
        assert_eq!(ids(&b.get_applied()), vec!["B.1"]);
        assert!(b.get_removed().is_empty());
        assert_eq!(ids(&a.visible()), vec!["A.1"]);

        assert!(a.verify_isolation());
        assert!(b.verify_isolation());

        // Writing B again does not disturb A
        b.set_applied(&[]).unwrap();
        assert_eq!(a.get_applied().len(), 2);
    }

    #[test]
    fn test_set_applied_drops_duplicate_ids() {
        let store = ScopedStore::with_scope(Persistence::memory(), "1");
        store.set_applied(&reqs(&["A.1", "A.1.", "A.2"])).unwrap();
        assert_eq!(ids(&store.get_applied()), vec!["A.1", "A.2"]);
    }

    #[test]
    fn test_corrupt_applied_list_self_heals() {
        let persistence = Persistence::memory();
        let store = ScopedStore::with_scope(persistence.clone(), "9");
        persistence
            .set_raw("workitem_9_selectedRequirements", "{{{ not json")
            .unwrap();

        assert!(store.get_applied().is_empty());
        assert_eq!(persistence.get_raw("workitem_9_selectedRequirements"), None);
    }

    #[test]
    fn test_verify_isolation_clears_only_own_corrupt_key() {
        let persistence = Persistence::memory();
        let mine = ScopedStore::with_scope(persistence.clone(), "1");
        persistence.set_raw("workitem_1_selectedRequirements", "garbage").unwrap();
        persistence.set_raw("workitem_2_selectedRequirements", "garbage").unwrap();

        assert!(!mine.verify_isolation());
        assert_eq!(persistence.get_raw("workitem_1_selectedRequirements"), None);
        assert_eq!(
            persistence.get_raw("workitem_2_selectedRequirements").as_deref(),
            Some("garbage")
        );
        assert!(mine.verify_isolation());
    }

    #[test]
    fn test_verify_isolation_flags_colliding_scope_without_deleting() {
        let persistence = Persistence::memory();
        let mine = ScopedStore::with_scope(persistence.clone(), "12");
        persistence.set_raw("workitem_12._selectedRequirements", "[]").unwrap();

        assert!(!mine.verify_isolation());
        assert!(persistence.get_raw("workitem_12._selectedRequirements").is_some());
    }

    #[test]
    fn test_independence_report() {
        let persistence = Persistence::memory();
        let a = ScopedStore::with_scope(persistence.clone(), "1");
        let b = ScopedStore::with_scope(persistence.clone(), "2");
        a.set_applied(&reqs(&["A"])).unwrap();
        a.set_removed(&[]).unwrap();
        b.set_applied(&reqs(&["B"])).unwrap();

        let report = a.independence_report().unwrap();
        assert_eq!(report.own_keys.len(), 2);
        assert_eq!(report.other_keys, 1);
        assert_eq!(report.scopes, 2);
    }

    #[test]
    fn test_cleanup_legacy_keys() {
        let persistence = Persistence::memory();
        for key in [
            "default_selectedRequirements",
            "workitem_null_selectedRequirements",
            "workitem_undefined_removedRequirementIds",
            "workitem_dev_12345_selectedRequirements",
            "workitem_5_selectedRequirements",
        ] {
            persistence.set_raw(key, "[]").unwrap();
        }

        let store = ScopedStore::new(persistence.clone());
        assert_eq!(store.cleanup_legacy_keys(), 4);
        assert_eq!(persistence.keys(), vec!["workitem_5_selectedRequirements"]);
    }

    #[test]
    fn test_migrate_temporary_scope() {
        let persistence = Persistence::memory();
        let mut store = ScopedStore::with_scope(persistence.clone(), "new_1_abc");
        store.set_applied(&reqs(&["A.1", "A.2"])).unwrap();
        store.set_removed(&["A.2".to_string()]).unwrap();

        // The permanent id already holds one overlapping entry
        let permanent = ScopedStore::with_scope(persistence.clone(), "77");
        permanent.set_applied(&reqs(&["A.1"])).unwrap();

        let report = store.migrate_scope("new_1_abc", "77").unwrap();
        assert_eq!(report, MigrationReport { applied: 1, removed: 1 });
        assert_eq!(store.scope(), Some("77"));
        assert_eq!(ids(&store.get_applied()), vec!["A.1", "A.2"]);
        assert_eq!(store.get_removed(), vec!["A.2".to_string()]);

        assert_eq!(persistence.get_raw("workitem_new_1_abc_selectedRequirements"), None);
        assert_eq!(persistence.get_raw("workitem_new_1_abc_removedRequirementIds"), None);
    }

    #[test]
    fn test_migrate_without_data_only_switches() {
        let mut store = ScopedStore::with_scope(Persistence::memory(), "new_2_x");
        let report = store.migrate_scope("new_2_x", "8").unwrap();
        assert_eq!(report, MigrationReport::default());
        assert_eq!(store.scope(), Some("8"));
        assert!(store.persistence().keys().is_empty());
    }
}
