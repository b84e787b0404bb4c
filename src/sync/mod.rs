//! Offline-first synchronization
//!
//! This module provides:
//! - A durable, priority-ordered, coalescing operation queue
//! - Last-write-wins conflict resolution
//! - The orchestrator that pushes, pulls and tracks connectivity
//! - SQLite and HTTP adapters for the local store and the remote API
//!
//! Architecture:
//! - Local writes land in the entity store first and enqueue one item per entity
//! - Pushes drain the queue by priority, then age
//! - Pulls never overwrite a record with an unpushed local edit

pub mod conflict;
pub mod connectivity;
pub mod local_store;
pub mod queue;
pub mod record;
pub mod remote;
pub mod service;
pub mod settings;
pub mod sqlite;
pub mod types;

// Re-export key types
pub use conflict::{Conflict, ConflictResolver, LastWriteWinsResolver, Resolution};
pub use connectivity::{Connectivity, HealthProbe, ManualConnectivity};
pub use local_store::LocalStore;
pub use queue::{SyncQueue, DEFAULT_MAX_ATTEMPTS};
pub use record::EntityRecord;
pub use remote::{HttpRemote, PushOutcome, RemoteApi, RemoteChange, StaticToken, TokenProvider};
pub use service::{SyncMetrics, SyncService};
pub use settings::{MemorySettings, SettingsStore};
pub use sqlite::SqliteStore;
pub use types::{
    EntitySyncStatus, EntityType, OperationType, SkipReason, SyncPriority, SyncQueueItem,
    SyncReport, SyncState, SyncStatus,
};
