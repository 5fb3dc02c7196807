pub mod bridge;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod hierarchy;
pub mod host;
pub mod models;
pub mod overrides;
pub mod scope;
pub mod storage;
pub mod surface;

// Re-export commonly used types
pub use bridge::{
    Broadcaster, Channel, DeliveryState, Fabric, FabricChannel, Notification, PendingRecord,
    PendingWatcher, PublishReport, Subscription, WatcherStatus,
};
pub use catalog::{default_catalog, Catalog, CATALOG_KEY};
pub use config::{get_settings_path, Settings};
pub use db::{create_backend, BackendType, FileBackend, KvBackend, MemoryBackend, SqliteBackend};
pub use error::{ChannelError, HostError, KvError, StoreError};
pub use hierarchy::{children_of, descendants, flatten_tree, is_removed, top_level};
pub use host::{generate_temporary_scope_id, HostBridge, ResolvedScope, StaticHost};
pub use models::{ids_match, normalize_id, Requirement, RequirementAttrs, RequirementEdit};
pub use scope::{IndependenceReport, MigrationReport, ScopedStore};
pub use storage::{Availability, Payload, Persistence, PENDING_KEY};
pub use surface::{
    BatchPrompt, ConsumeGuard, ConsumeOutcome, Confirmer, InitReport, Liveness, WorkItemSurface,
};
