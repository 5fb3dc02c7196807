use serde::Serialize;

use super::fabric::Channel;
use super::notification::{
    now_ms, payload_key, BatchAnnouncement, Notification, PendingRecord, RefreshHint,
    ACTION_REQUIREMENTS_APPLIED,
};
use crate::error::StoreError;
use crate::models::Requirement;
use crate::storage::{Persistence, PENDING_KEY};

/// How a single channel fared during a publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Delivered { receivers: usize },
    /// The channel worked but nobody was listening
    NoReceivers,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelReport {
    pub channel: String,
    #[serde(flatten)]
    pub state: DeliveryState,
}

/// Outcome of [`Broadcaster::publish`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    pub batch_key: String,
    pub count: usize,
    pub timestamp: i64,
    /// Batch key of an unconsumed batch this one replaced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded: Option<String>,
    pub channels: Vec<ChannelReport>,
}

impl PublishReport {
    /// True if at least one live context was reached directly. Delivery is
    /// advisory; the stored batch is picked up on load regardless.
    pub fn delivered_any(&self) -> bool {
        self.channels
            .iter()
            .any(|c| matches!(c.state, DeliveryState::Delivered { .. }))
    }
}

/// Publishes requirement batches from the catalog context.
///
/// The batch is made durable first and only then announced, so a context
/// that misses every announcement still finds it in the store.
pub struct Broadcaster {
    persistence: Persistence,
    channels: Vec<Box<dyn Channel>>,
    source_tag: String,
}

impl Broadcaster {
    pub fn new(persistence: Persistence, source_tag: impl Into<String>) -> Self {
        Self {
            persistence,
            channels: Vec::new(),
            source_tag: source_tag.into(),
        }
    }

    pub fn with_channel(mut self, channel: Box<dyn Channel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn add_channel(&mut self, channel: Box<dyn Channel>) {
        self.channels.push(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Stores `requirements` as a new pending batch and announces it on
    /// every channel. Any unconsumed batch is replaced.
    pub fn publish(&self, requirements: &[Requirement]) -> Result<PublishReport, StoreError> {
        if requirements.is_empty() {
            return Err(StoreError::Invalid("no requirements selected".to_string()));
        }

        let mut timestamp = now_ms();
        while self.persistence.get_raw(&payload_key(timestamp)).is_some() {
            timestamp += 1;
        }
        let batch_key = payload_key(timestamp);

        self.persistence.set(&batch_key, requirements)?;

        let record = PendingRecord::new(&batch_key, requirements.len(), timestamp, &self.source_tag);
        let previous: Option<PendingRecord> = self.persistence.get(PENDING_KEY);
        if let Err(e) =
            self.persistence
                .set_protecting(PENDING_KEY, &record, &[batch_key.as_str()])
        {
            if let Err(cleanup) = self.persistence.remove(&batch_key) {
                log::warn!("failed to drop orphaned payload {}: {}", batch_key, cleanup);
            }
            return Err(e);
        }

        let superseded = previous
            .map(|p| p.batch_key)
            .filter(|key| !key.is_empty() && *key != batch_key);
        if let Some(old) = &superseded {
            log::info!("batch {} replaces unconsumed batch {}", batch_key, old);
            if let Err(e) = self.persistence.remove(old) {
                log::warn!("failed to remove superseded payload {}: {}", old, e);
            }
        }

        log::info!(
            "published {} requirements as {}",
            requirements.len(),
            batch_key
        );

        let announcement = Notification::RequirementsAvailable(BatchAnnouncement {
            requirements: requirements.to_vec(),
            batch_key: batch_key.clone(),
            count: requirements.len(),
            timestamp,
            source_tag: self.source_tag.clone(),
        });
        let channels = self.fan_out(&announcement);

        let refresh = Notification::Refresh(RefreshHint {
            action: ACTION_REQUIREMENTS_APPLIED.to_string(),
            count: requirements.len(),
            timestamp,
        });
        for channel in &self.channels {
            if let Err(e) = channel.deliver(&refresh) {
                log::debug!("refresh hint not delivered on {}: {}", channel.name(), e);
            }
        }

        Ok(PublishReport {
            batch_key,
            count: requirements.len(),
            timestamp,
            superseded,
            channels,
        })
    }

    /// Delivers `notice` on every channel; one failing channel does not stop
    /// the others.
    fn fan_out(&self, notice: &Notification) -> Vec<ChannelReport> {
        self.channels
            .iter()
            .map(|channel| {
                let state = match channel.deliver(notice) {
                    Ok(0) => DeliveryState::NoReceivers,
                    Ok(receivers) => DeliveryState::Delivered { receivers },
                    Err(e) => {
                        log::warn!("{} delivery failed: {}", notice.kind(), e);
                        DeliveryState::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                ChannelReport {
                    channel: channel.name().to_string(),
                    state,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fabric::{Fabric, FabricChannel};
    use crate::db::MemoryBackend;
    use std::sync::Arc;

    fn batch() -> Vec<Requirement> {
        vec![
            Requirement::new("Mod.1.1", "APIs estandarizadas").with_parent("Mod.1"),
            Requirement::new("Mod.1.2", "Formatos comunes").with_parent("Mod.1"),
        ]
    }

    #[test]
    fn test_publish_persists_before_announcing() {
        let persistence = Persistence::memory();
        let fabric = Fabric::new();
        let (_sub, rx) = fabric.subscribe();
        let broadcaster = Broadcaster::new(persistence.clone(), "hub")
            .with_channel(Box::new(FabricChannel::new("top", fabric.clone())));

        let report = broadcaster.publish(&batch()).unwrap();
        assert_eq!(report.count, 2);
        assert!(report.batch_key.starts_with("pending_requirements_"));
        assert_eq!(
            report.channels[0].state,
            DeliveryState::Delivered { receivers: 1 }
        );

        let record: PendingRecord = persistence.get(PENDING_KEY).unwrap();
        assert_eq!(record.batch_key, report.batch_key);
        assert_eq!(record.count, 2);
        assert_eq!(record.source_tag, "hub");
        let payload: Vec<Requirement> = persistence.get(&report.batch_key).unwrap();
        assert_eq!(payload, batch());

        match rx.try_recv().unwrap() {
            Notification::RequirementsAvailable(body) => {
                assert_eq!(body.batch_key, report.batch_key);
                assert_eq!(body.requirements.len(), 2);
            }
            other => panic!("expected announcement, got {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), Notification::Refresh(_)));
    }

    #[test]
    fn test_failed_channel_does_not_stop_others() {
        let dead = Fabric::new();
        dead.close();
        let live = Fabric::new();
        let (_sub, _rx) = live.subscribe();
        let empty = Fabric::new();

        let broadcaster = Broadcaster::new(Persistence::memory(), "hub")
            .with_channel(Box::new(FabricChannel::new("parent", dead)))
            .with_channel(Box::new(FabricChannel::new("frames", live)))
            .with_channel(Box::new(FabricChannel::new("self", empty)));

        let report = broadcaster.publish(&batch()).unwrap();
        assert!(matches!(report.channels[0].state, DeliveryState::Failed { .. }));
        assert_eq!(
            report.channels[1].state,
            DeliveryState::Delivered { receivers: 1 }
        );
        assert_eq!(report.channels[2].state, DeliveryState::NoReceivers);
        assert!(report.delivered_any());
    }

    #[test]
    fn test_publish_without_listeners_still_stores() {
        let persistence = Persistence::memory();
        let report = Broadcaster::new(persistence.clone(), "hub")
            .publish(&batch())
            .unwrap();
        assert!(!report.delivered_any());
        assert!(persistence.get_raw(PENDING_KEY).is_some());
    }

    #[test]
    fn test_republish_replaces_unconsumed_batch() {
        let persistence = Persistence::memory();
        let broadcaster = Broadcaster::new(persistence.clone(), "hub");

        let first = broadcaster.publish(&batch()).unwrap();
        let second = broadcaster.publish(&batch()[..1]).unwrap();

        assert_ne!(first.batch_key, second.batch_key);
        assert_eq!(second.superseded.as_deref(), Some(first.batch_key.as_str()));
        assert!(persistence.get_raw(&first.batch_key).is_none());
        let record: PendingRecord = persistence.get(PENDING_KEY).unwrap();
        assert_eq!(record.batch_key, second.batch_key);
        assert_eq!(record.count, 1);
    }

    #[test]
    fn test_publish_rejects_empty_batch() {
        let broadcaster = Broadcaster::new(Persistence::memory(), "hub");
        assert!(matches!(
            broadcaster.publish(&[]),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_quota_failure_leaves_no_partial_batch() {
        let persistence = Persistence::new(Arc::new(MemoryBackend::with_quota(64)));
        let broadcaster = Broadcaster::new(persistence.clone(), "hub");
        assert!(matches!(
            broadcaster.publish(&batch()),
            Err(StoreError::QuotaExceeded { .. })
        ));
        assert!(persistence.keys().is_empty());
    }

    #[test]
    fn test_publish_under_quota_pressure_keeps_its_payload() {
        let ts = now_ms();
        let key = payload_key(ts);
        let payload_size = key.len() + serde_json::to_string(&batch()).unwrap().len();
        let record = PendingRecord::new(&key, 2, ts, "hub");
        let record_size = PENDING_KEY.len() + serde_json::to_string(&record).unwrap().len();

        // A newer backup sorts after the fresh payload, so only the protect
        // list keeps the payload from being evicted first.
        let backup = "backup_catalog_9999999999999";
        let backup_value = "b".repeat(100);
        let quota = backup.len() + backup_value.len() + payload_size + record_size - 5;
        let persistence = Persistence::new(Arc::new(MemoryBackend::with_quota(quota)));
        persistence.set_raw(backup, &backup_value).unwrap();

        let report = Broadcaster::new(persistence.clone(), "hub")
            .publish(&batch())
            .unwrap();

        let stored: PendingRecord = persistence.get(PENDING_KEY).unwrap();
        assert_eq!(stored.batch_key, report.batch_key);
        let payload: Vec<Requirement> = persistence.get(&report.batch_key).unwrap();
        assert_eq!(payload, batch());
        assert_eq!(persistence.get_raw(backup), None);
    }
}
