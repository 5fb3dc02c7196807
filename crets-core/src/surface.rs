//! Work item surface
//!
//! One surface per open work item form. It binds a [`ScopedStore`] to the
//! item the host reports, and consumes pending batches published by the
//! catalog context: on start-up, and whenever a live notification or the
//! watcher hints that one may be waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{now_ms, Fabric, Notification, PendingRecord, Subscription};
use crate::config::Settings;
use crate::error::StoreError;
use crate::host::{is_temporary_scope_id, HostBridge, FIELD_WORK_ITEM_TYPE};
use crate::models::Requirement;
use crate::scope::{MigrationReport, ScopedStore};
use crate::storage::{Persistence, PENDING_KEY};

/// What the user is asked to accept
#[derive(Debug, Clone)]
pub struct BatchPrompt {
    pub scope: String,
    pub count: usize,
    pub source_tag: String,
    pub requirements: Vec<Requirement>,
}

/// Asks the user whether to apply a batch
pub trait Confirmer {
    fn confirm(&mut self, prompt: &BatchPrompt) -> bool;
}

impl<F> Confirmer for F
where
    F: FnMut(&BatchPrompt) -> bool,
{
    fn confirm(&mut self, prompt: &BatchPrompt) -> bool {
        self(prompt)
    }
}

/// Result of one consumption attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    NothingPending,
    /// Another consumption is mid-flight in this surface; signal dropped
    Busy,
    /// No scope bound yet, batch left in place for a scoped surface
    Unscoped,
    /// Batch older than the threshold, discarded unseen
    Stale,
    /// Record without a usable batch key, count or payload body
    Incomplete,
    /// Record pointed at a payload that no longer exists
    MissingPayload,
    Declined,
    Applied { added: usize, total: usize },
    /// Accepted but the merged list could not be written
    Failed { reason: String },
    /// Surface was torn down while the prompt was open
    Abandoned,
    /// A refresh hint; nothing to consume
    Refresh,
}

/// Shared flag cleared when the surface goes away. Long-running work checks
/// it before applying results.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn end(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Re-entrancy guard around consumption
#[derive(Debug, Clone, Default)]
pub struct ConsumeGuard(Arc<AtomicBool>);

impl ConsumeGuard {
    /// Enters the guarded section, or returns `None` if it is occupied
    pub fn try_enter(&self) -> Option<ConsumeToken> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ConsumeToken(Arc::clone(&self.0)))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Held while a consumption runs; releases the guard on drop
#[derive(Debug)]
pub struct ConsumeToken(Arc<AtomicBool>);

impl Drop for ConsumeToken {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Summary of [`WorkItemSurface::initialize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub scope: Option<String>,
    pub is_temporary: bool,
    pub work_item_type: Option<String>,
    pub legacy_keys_removed: usize,
    pub independent: bool,
    pub pending: ConsumeOutcome,
}

pub struct WorkItemSurface {
    store: ScopedStore,
    stale_after: Duration,
    temporary: bool,
    guard: ConsumeGuard,
    liveness: Liveness,
    subscriptions: Vec<Subscription>,
}

impl WorkItemSurface {
    pub fn new(persistence: Persistence, stale_after: Duration) -> Self {
        Self {
            store: ScopedStore::new(persistence),
            stale_after,
            temporary: false,
            guard: ConsumeGuard::default(),
            liveness: Liveness::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn from_settings(persistence: Persistence, settings: &Settings) -> Self {
        Self::new(persistence, settings.stale_after())
    }

    pub fn store(&self) -> &ScopedStore {
        &self.store
    }

    pub fn scope(&self) -> Option<&str> {
        self.store.scope()
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn consume_guard(&self) -> ConsumeGuard {
        self.guard.clone()
    }

    /// Subscribes to `fabric`; the subscription lives as long as the surface
    pub fn listen(&mut self, fabric: &Fabric) -> Receiver<Notification> {
        let (subscription, rx) = fabric.subscribe();
        self.subscriptions.push(subscription);
        rx
    }

    /// Binds the surface to the host's open work item and picks up any
    /// batch published while no surface was running.
    pub fn initialize(
        &mut self,
        host: &dyn HostBridge,
        confirmer: &mut dyn Confirmer,
    ) -> InitReport {
        let legacy_keys_removed = self.store.cleanup_legacy_keys();

        let resolved = match host.resolve_active_scope() {
            Ok(resolved) => resolved,
            Err(e) => {
                log::warn!("{} ({}); surface stays unscoped", StoreError::ScopeUnresolved, e);
                return InitReport {
                    scope: None,
                    is_temporary: false,
                    work_item_type: None,
                    legacy_keys_removed,
                    independent: false,
                    pending: ConsumeOutcome::Unscoped,
                };
            }
        };

        self.store.set_scope(&resolved.id);
        self.temporary = resolved.is_temporary;

        let work_item_type = match host.field_values(&[FIELD_WORK_ITEM_TYPE]) {
            Ok(fields) => fields
                .get(FIELD_WORK_ITEM_TYPE)
                .and_then(|v| v.as_str())
                .map(str::to_string),
            Err(e) => {
                log::debug!("work item fields unavailable: {}", e);
                None
            }
        };

        let independent = self.store.verify_isolation();
        if !independent {
            log::warn!("work item {} is not fully isolated", resolved.id);
        }

        log::info!(
            "surface initialized for {}{}",
            resolved.id,
            if resolved.is_temporary { " (unsaved)" } else { "" }
        );

        let pending = self.check_pending(confirmer);
        InitReport {
            scope: Some(resolved.id),
            is_temporary: resolved.is_temporary,
            work_item_type,
            legacy_keys_removed,
            independent,
            pending,
        }
    }

    /// Live signals only hint that the stored record should be checked;
    /// the announcement body itself is never applied.
    pub fn handle_notification(
        &mut self,
        notice: &Notification,
        confirmer: &mut dyn Confirmer,
    ) -> ConsumeOutcome {
        match notice {
            Notification::RequirementsAvailable(body) => {
                log::debug!("notified of batch {}", body.batch_key);
                self.check_pending(confirmer)
            }
            Notification::Refresh(_) => ConsumeOutcome::Refresh,
        }
    }

    /// Claims and consumes the pending batch, if any.
    ///
    /// The pending record is taken atomically, so of several surfaces racing
    /// on one batch exactly one proceeds. Past the claim, the payload is
    /// deleted on every path except abandonment.
    pub fn check_pending(&mut self, confirmer: &mut dyn Confirmer) -> ConsumeOutcome {
        if !self.liveness.is_alive() {
            return ConsumeOutcome::Abandoned;
        }
        let Some(_token) = self.guard.try_enter() else {
            log::debug!("consumption already in progress, dropping signal");
            return ConsumeOutcome::Busy;
        };
        let Some(scope) = self.store.scope().map(str::to_string) else {
            log::warn!("{}; leaving pending batch in place", StoreError::ScopeUnresolved);
            return ConsumeOutcome::Unscoped;
        };

        let persistence = self.store.persistence().clone();
        let Some(record) = persistence.take::<PendingRecord>(PENDING_KEY) else {
            return ConsumeOutcome::NothingPending;
        };

        if !record.is_complete() {
            log::warn!("discarding incomplete pending record {:?}", record);
            self.discard_payload(&record);
            return ConsumeOutcome::Incomplete;
        }

        let now = now_ms();
        if record.is_stale(now, self.stale_after) {
            log::warn!(
                "{}; discarding {}",
                StoreError::StaleBatch {
                    age_ms: record.age_ms(now)
                },
                record.batch_key
            );
            self.discard_payload(&record);
            return ConsumeOutcome::Stale;
        }

        let Some(batch) = persistence.get::<Vec<Requirement>>(&record.batch_key) else {
            log::warn!("pending batch {} has no payload", record.batch_key);
            return ConsumeOutcome::MissingPayload;
        };
        if batch.is_empty() {
            self.discard_payload(&record);
            return ConsumeOutcome::Incomplete;
        }

        let prompt = BatchPrompt {
            scope,
            count: batch.len(),
            source_tag: record.source_tag.clone(),
            requirements: batch,
        };
        let accepted = confirmer.confirm(&prompt);

        if !self.liveness.is_alive() {
            self.release(&record);
            return ConsumeOutcome::Abandoned;
        }

        let outcome = if accepted {
            match self.merge(&prompt.requirements) {
                Ok((added, total)) => {
                    log::info!(
                        "applied {} of {} requirements from {} to {}",
                        added,
                        prompt.count,
                        record.batch_key,
                        prompt.scope
                    );
                    ConsumeOutcome::Applied { added, total }
                }
                Err(e) => {
                    log::error!("failed to apply {}: {}", record.batch_key, e);
                    ConsumeOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        } else {
            log::info!("batch {} declined", record.batch_key);
            ConsumeOutcome::Declined
        };

        self.discard_payload(&record);
        outcome
    }

    /// Appends accepted requirements that are not already applied and
    /// un-hides them. Returns `(added, total)`.
    fn merge(&self, batch: &[Requirement]) -> Result<(usize, usize), StoreError> {
        let mut applied = self.store.get_applied();
        let mut added = 0;
        for req in batch {
            if !applied.iter().any(|a| a.is(&req.id)) {
                applied.push(req.clone());
                added += 1;
            }
        }
        self.store.set_applied(&applied)?;

        let removed = self.store.get_removed();
        let kept: Vec<String> = removed
            .iter()
            .filter(|id| !batch.iter().any(|r| r.is(id)))
            .cloned()
            .collect();
        if kept.len() != removed.len() {
            self.store.set_removed(&kept)?;
        }

        Ok((added, self.store.get_applied().len()))
    }

    fn discard_payload(&self, record: &PendingRecord) {
        if record.batch_key.is_empty() {
            return;
        }
        if let Err(e) = self.store.persistence().remove(&record.batch_key) {
            log::warn!("failed to delete payload {}: {}", record.batch_key, e);
        }
    }

    /// Hands a claimed batch back so another surface can pick it up
    fn release(&self, record: &PendingRecord) {
        let persistence = self.store.persistence();
        if persistence.get_raw(PENDING_KEY).is_some() {
            log::info!("newer batch pending, dropping abandoned {}", record.batch_key);
            self.discard_payload(record);
            return;
        }
        match persistence.set(PENDING_KEY, record) {
            Ok(()) => log::info!("released batch {} after teardown", record.batch_key),
            Err(e) => log::warn!("failed to release batch {}: {}", record.batch_key, e),
        }
    }

    /// The host switched the form to work item `id`. Returns true if the
    /// scope changed.
    pub fn on_loaded(&mut self, id: &str) -> bool {
        if !self.store.set_scope(id) {
            return false;
        }
        self.temporary = is_temporary_scope_id(id);
        if !self.store.verify_isolation() {
            log::warn!("work item {} is not fully isolated", id);
        }
        true
    }

    /// The host saved the form under `permanent_id`. Data gathered under a
    /// temporary scope moves to the permanent one.
    pub fn on_saved(&mut self, permanent_id: &str) -> Result<Option<MigrationReport>, StoreError> {
        let current = self.store.scope().map(str::to_string);
        match current {
            Some(old) if self.temporary && old != permanent_id => {
                let report = self.store.migrate_scope(&old, permanent_id)?;
                self.temporary = false;
                Ok(Some(report))
            }
            _ => {
                self.on_loaded(permanent_id);
                self.temporary = false;
                Ok(None)
            }
        }
    }

    /// Marks the surface dead and drops its listeners
    pub fn teardown(&mut self) {
        if self.liveness.is_alive() {
            log::debug!("surface for {:?} torn down", self.scope());
        }
        self.liveness.end();
        self.subscriptions.clear();
    }
}

impl Drop for WorkItemSurface {
    fn drop(&mut self) {
        self.teardown();
    }
}
