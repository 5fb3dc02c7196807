//! Item-local edits, restoration and cascading removal
//!
//! Edits only ever touch the work item's own copy of a requirement; the
//! catalog entry it came from is never referenced.

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::hierarchy::{descendants, is_removed};
use crate::models::{Requirement, RequirementEdit};
use crate::scope::ScopedStore;

/// Applies `edit` to `record`, snapshotting it first if this is its first
/// edit. Later edits keep the earliest snapshot.
pub fn edit_record(record: &mut Requirement, edit: &RequirementEdit, now: DateTime<Utc>) {
    if !record.is_modified {
        let mut snapshot = record.clone();
        snapshot.original_snapshot = None;
        record.original_snapshot = Some(Box::new(snapshot));
    }

    if let Some(detail) = &edit.detail {
        record.attrs.detail = detail.clone();
    }
    if let Some(justification) = &edit.justification {
        record.attrs.justification = Some(justification.clone());
    }
    if let Some(discussion) = &edit.discussion {
        record.attrs.discussion = Some(discussion.clone());
    }
    record.is_modified = true;
    record.modified_date = Some(now);
}

/// Puts the snapshot back. Returns false if there was none.
pub fn restore_record(record: &mut Requirement) -> bool {
    let Some(snapshot) = record.original_snapshot.take() else {
        return false;
    };
    *record = *snapshot;
    record.is_modified = false;
    record.modified_date = None;
    record.original_snapshot = None;
    true
}

/// `removed` extended with `id` and all of its descendants in `collection`
pub fn cascade_removal(id: &str, collection: &[Requirement], removed: &[String]) -> Vec<String> {
    let root = collection
        .iter()
        .find(|r| r.is(id))
        .map(|r| r.id.clone())
        .unwrap_or_else(|| id.to_string());

    let mut closure = vec![root.clone()];
    closure.extend(descendants(&root, collection));

    let mut updated = removed.to_vec();
    for member in closure {
        if !is_removed(&updated, &member) {
            updated.push(member);
        }
    }
    updated
}

impl ScopedStore {
    /// Records an item-local edit of requirement `id`
    pub fn apply_edit(&self, id: &str, edit: &RequirementEdit) -> Result<Requirement, StoreError> {
        if edit.is_empty() {
            return Err(StoreError::Invalid(format!("{}: edit changes nothing", id)));
        }

        let mut applied = self.get_applied();
        let record = applied
            .iter_mut()
            .find(|r| r.is(id))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        edit_record(record, edit, Utc::now());
        let edited = record.clone();

        self.set_applied(&applied)?;
        log::info!("edited requirement {} locally", edited.id);
        Ok(edited)
    }

    /// Reverts requirement `id` to its pre-edit state.
    ///
    /// Returns false (and writes nothing) if it was never edited.
    pub fn restore(&self, id: &str) -> Result<bool, StoreError> {
        let mut applied = self.get_applied();
        let Some(record) = applied.iter_mut().find(|r| r.is(id)) else {
            return Ok(false);
        };
        if !restore_record(record) {
            return Ok(false);
        }

        self.set_applied(&applied)?;
        log::info!("restored requirement {}", id);
        Ok(true)
    }

    /// Hides `id` and its whole subtree by adding them to the removed set.
    /// The applied list itself is left as is. Returns the new removed set.
    pub fn remove_cascade(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let applied = self.get_applied();
        let removed = self.get_removed();
        let updated = cascade_removal(id, &applied, &removed);

        self.set_removed(&updated)?;
        log::info!(
            "removed {} and {} descendants",
            id,
            updated.len().saturating_sub(removed.len()).saturating_sub(1)
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Persistence;
    use std::collections::BTreeSet;

    fn store_with(reqs: Vec<Requirement>) -> ScopedStore {
        let store = ScopedStore::with_scope(Persistence::memory(), "500");
        store.set_applied(&reqs).unwrap();
        store
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> Requirement {
        let mut req = Requirement::new("Mod.1.1", "El software debe utilizar APIs estandarizadas")
            .with_parent("Mod.1");
        req.attrs.justification = Some("Facilita la integración".to_string());
        req
    }

    #[test]
    fn test_edit_then_restore_round_trip() {
        let original = sample();
        let before = serde_json::to_string(&original).unwrap();
        let store = store_with(vec![original]);

        let edited = store.apply_edit("Mod.1.1", &RequirementEdit::detail("X")).unwrap();
        assert!(edited.is_modified);
        assert!(edited.modified_date.is_some());
        assert_eq!(edited.attrs.detail, "X");
        assert_eq!(edited.attrs.justification.as_deref(), Some("Facilita la integración"));

        assert!(store.restore("Mod.1.1").unwrap());
        let restored = store.get_applied().remove(0);
        assert!(!restored.is_modified);
        assert!(restored.original_snapshot.is_none());
        assert_eq!(serde_json::to_string(&restored).unwrap(), before);
    }

    #[test]
    fn test_double_edit_keeps_first_snapshot() {
        let original = sample();
        let store = store_with(vec![original.clone()]);

        store.apply_edit("Mod.1.1", &RequirementEdit::detail("X")).unwrap();
        let second = store.apply_edit("Mod.1.1.", &RequirementEdit::detail("Y")).unwrap();
        assert_eq!(second.attrs.detail, "Y");
        assert_eq!(
            second.original_snapshot.as_ref().unwrap().attrs.detail,
            original.attrs.detail
        );

        store.restore("Mod.1.1").unwrap();
        assert_eq!(store.get_applied()[0], original);
    }

    #[test]
    fn test_restore_without_snapshot_is_noop() {
        let store = store_with(vec![sample()]);
        assert!(!store.restore("Mod.1.1").unwrap());
        assert!(!store.restore("missing").unwrap());
        assert_eq!(store.get_applied()[0], sample());
    }

    #[test]
    fn test_edit_unknown_or_empty() {
        let store = store_with(vec![sample()]);
        assert!(matches!(
            store.apply_edit("nope", &RequirementEdit::detail("X")),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.apply_edit("Mod.1.1", &RequirementEdit::default()),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_edits_do_not_leak_across_scopes() {
        let persistence = Persistence::memory();
        let a = ScopedStore::with_scope(persistence.clone(), "1");
        let b = ScopedStore::with_scope(persistence.clone(), "2");
        a.set_applied(&[sample()]).unwrap();
        b.set_applied(&[sample()]).unwrap();

        a.apply_edit("Mod.1.1", &RequirementEdit::detail("only in 1")).unwrap();
        assert_eq!(b.get_applied()[0], sample());
    }

    #[test]
    fn test_remove_cascade_chain() {
        let store = store_with(vec![
            Requirement::new("root", "r"),
            Requirement::new("c1", "1").with_parent("root"),
            Requirement::new("c2", "2").with_parent("c1"),
            Requirement::new("c3", "3").with_parent("c2"),
            Requirement::new("other", "o"),
            Requirement::new("sib", "s").with_parent("other"),
        ]);

        let removed = store.remove_cascade("root").unwrap();
        assert_eq!(
            removed.into_iter().collect::<BTreeSet<_>>(),
            set(&["root", "c1", "c2", "c3"])
        );
        // Applied list untouched; visibility comes from the removed set
        assert_eq!(store.get_applied().len(), 6);
        let visible: Vec<String> = store.visible().into_iter().map(|r| r.id).collect();
        assert_eq!(visible, vec!["other", "sib"]);
    }

    #[test]
    fn test_remove_cascade_cycle_terminates() {
        let store = store_with(vec![
            Requirement::new("a", "A").with_parent("b"),
            Requirement::new("b", "B").with_parent("a"),
        ]);
        let removed = store.remove_cascade("a").unwrap();
        assert_eq!(removed.into_iter().collect::<BTreeSet<_>>(), set(&["a", "b"]));
    }

    #[test]
    fn test_remove_cascade_accumulates() {
        let store = store_with(vec![
            Requirement::new("a", "A"),
            Requirement::new("b", "B"),
        ]);
        store.remove_cascade("a").unwrap();
        store.remove_cascade("a.").unwrap();
        let removed = store.remove_cascade("b").unwrap();
        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
    }
}
