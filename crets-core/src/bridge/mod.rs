//! Cross-context notification protocol
//!
//! A batch is written to the store, then announced on every channel. Direct
//! delivery is best effort; the stored record is what consumers rely on.

mod fabric;
mod notification;
mod publisher;
mod watcher;

pub use fabric::{Channel, Fabric, FabricChannel, Subscription};
pub use notification::{
    now_ms, payload_key, BatchAnnouncement, Notification, PendingRecord, RefreshHint,
    ACTION_REQUIREMENTS_APPLIED, REFRESH, REQUIREMENTS_AVAILABLE,
};
pub use publisher::{Broadcaster, ChannelReport, DeliveryState, PublishReport};
pub use watcher::{PendingWatcher, WatcherCommand, WatcherStatus};
