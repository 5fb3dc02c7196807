use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::Requirement;
use crate::storage::PENDING_PAYLOAD_PREFIX;

/// Notification type announcing a new batch
pub const REQUIREMENTS_AVAILABLE: &str = "requirements.available";
/// Notification type asking open views to refresh
pub const REFRESH: &str = "crets.refresh";
/// Action carried by the refresh hint sent after a publish
pub const ACTION_REQUIREMENTS_APPLIED: &str = "requirements-applied";

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Store key for a batch payload published at `timestamp`
pub fn payload_key(timestamp: i64) -> String {
    format!("{}{}", PENDING_PAYLOAD_PREFIX, timestamp)
}

/// Metadata record stored under the well-known pending key.
///
/// Older publishers wrote `key`/`source` instead of `batchKey`/`sourceTag`;
/// both spellings are accepted on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    #[serde(alias = "key", default)]
    pub batch_key: String,

    #[serde(default)]
    pub count: usize,

    /// Publish time in epoch milliseconds
    #[serde(default)]
    pub timestamp: i64,

    #[serde(alias = "source", default)]
    pub source_tag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PendingRecord {
    pub fn new(batch_key: impl Into<String>, count: usize, timestamp: i64, source_tag: &str) -> Self {
        Self {
            batch_key: batch_key.into(),
            count,
            timestamp,
            source_tag: source_tag.to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    /// A record without a batch key or count cannot be acted on
    pub fn is_complete(&self) -> bool {
        !self.batch_key.is_empty() && self.count > 0
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp)
    }

    /// True once the record is older than `threshold`
    pub fn is_stale(&self, now_ms: i64, threshold: Duration) -> bool {
        let limit = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        self.age_ms(now_ms) > limit
    }
}

/// Body of a `requirements.available` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAnnouncement {
    pub requirements: Vec<Requirement>,
    pub batch_key: String,
    pub count: usize,
    pub timestamp: i64,
    #[serde(default)]
    pub source_tag: String,
}

impl BatchAnnouncement {
    pub fn record(&self) -> PendingRecord {
        PendingRecord::new(&self.batch_key, self.count, self.timestamp, &self.source_tag)
    }
}

/// Body of a `crets.refresh` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshHint {
    pub action: String,
    pub count: usize,
    pub timestamp: i64,
}

/// Messages exchanged between contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    #[serde(rename = "requirements.available")]
    RequirementsAvailable(BatchAnnouncement),

    #[serde(rename = "crets.refresh")]
    Refresh(RefreshHint),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::RequirementsAvailable(_) => REQUIREMENTS_AVAILABLE,
            Notification::Refresh(_) => REFRESH,
        }
    }

    /// Parses a message received from another context. Unknown types and
    /// malformed bodies yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(notice) => Some(notice),
            Err(e) => {
                log::debug!("ignoring unrecognised message: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_record_accepts_legacy_field_names() {
        let raw = r#"{"key":"pending_requirements_17","count":2,"timestamp":17,"source":"CRETS4DevOps-Hub","version":"2.1.4"}"#;
        let record: PendingRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.batch_key, "pending_requirements_17");
        assert_eq!(record.source_tag, "CRETS4DevOps-Hub");
        assert_eq!(record.version.as_deref(), Some("2.1.4"));
        assert!(record.is_complete());

        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["batchKey"], "pending_requirements_17");
    }

    #[test]
    fn test_incomplete_record() {
        let record: PendingRecord = serde_json::from_str(r#"{"timestamp":5}"#).unwrap();
        assert!(!record.is_complete());
        assert!(!PendingRecord::new("k", 0, 1, "x").is_complete());
    }

    #[test]
    fn test_staleness_threshold() {
        let record = PendingRecord::new("k", 1, 1_000, "x");
        let five_minutes = Duration::from_secs(300);
        assert!(!record.is_stale(1_000 + 300_000, five_minutes));
        assert!(record.is_stale(1_000 + 300_001, five_minutes));
        // Clock skew: a record from the future is never stale
        assert!(!record.is_stale(0, five_minutes));
    }

    #[test]
    fn test_notification_wire_format() {
        let notice = Notification::Refresh(RefreshHint {
            action: ACTION_REQUIREMENTS_APPLIED.to_string(),
            count: 3,
            timestamp: 42,
        });
        let raw = serde_json::to_string(&notice).unwrap();
        assert!(raw.contains(r#""type":"crets.refresh""#));
        assert_eq!(Notification::parse(&raw), Some(notice));

        let available = r#"{"type":"requirements.available","requirements":[{"id":"Mod.1.1","attrs":{"detail":"x"}}],"batchKey":"pending_requirements_9","count":1,"timestamp":9}"#;
        match Notification::parse(available) {
            Some(Notification::RequirementsAvailable(body)) => {
                assert_eq!(body.requirements[0].id, "Mod.1.1");
                assert_eq!(body.record().batch_key, "pending_requirements_9");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(Notification::parse(r#"{"type":"something.else"}"#), None);
        assert_eq!(Notification::parse("not json"), None);
    }

    #[test]
    fn test_payload_key() {
        assert_eq!(payload_key(123), "pending_requirements_123");
    }
}
