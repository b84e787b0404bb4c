pub mod config;
pub mod error;
pub mod sync;

pub use config::{Config, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use sync::{
    EntityType, OperationType, SyncPriority, SyncQueue, SyncQueueItem, SyncService, SyncState,
    SyncStatus,
};
