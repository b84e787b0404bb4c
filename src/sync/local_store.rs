//! Contract the local entity store exposes to the sync engine

use async_trait::async_trait;

use super::record::EntityRecord;
use super::types::EntityType;
use crate::error::SyncResult;

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch a live (not soft-deleted) record
    async fn get(&self, entity_type: EntityType, id: &str) -> SyncResult<Option<EntityRecord>>;

    async fn insert(&self, record: &EntityRecord) -> SyncResult<()>;

    /// Overwrite an existing record, sync columns included
    async fn update(&self, record: &EntityRecord) -> SyncResult<()>;

    async fn soft_delete(&self, entity_type: EntityType, id: &str) -> SyncResult<()>;

    /// Record a server acknowledgement: status becomes synced and the
    /// server version is stored when known.
    async fn mark_synced(
        &self,
        entity_type: EntityType,
        id: &str,
        server_version: Option<u64>,
    ) -> SyncResult<()>;
}
