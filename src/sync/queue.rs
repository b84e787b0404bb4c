//! Durable coalescing operation queue
//!
//! Holds at most one pending mutation per entity, drains by priority then
//! FIFO, and writes the full snapshot to settings storage after every change
//! so a restart rebuilds the exact pending set.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::settings::{SettingsStore, QUEUE_KEY};
use super::types::{EntityType, OperationType, SyncQueueItem};
use crate::error::{SyncError, SyncResult};

/// Attempts after which an item stops draining
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub struct SyncQueue {
    settings: Arc<dyn SettingsStore>,
    /// Kept sorted by (priority, queued_at)
    items: Vec<SyncQueueItem>,
    max_attempts: u32,
}

impl SyncQueue {
    /// Rebuild the queue from settings storage.
    ///
    /// Unreadable or corrupted snapshots reset to an empty queue.
    pub fn load(settings: Arc<dyn SettingsStore>, max_attempts: u32) -> Self {
        let items = match settings.get(QUEUE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<SyncQueueItem>>(&raw) {
                Ok(items) => items,
                Err(e) => {
                    warn!("Discarding corrupted sync queue snapshot: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read sync queue snapshot: {}", e);
                Vec::new()
            }
        };

        let mut queue = Self {
            settings,
            items,
            max_attempts,
        };
        queue.sort();
        debug!("Loaded sync queue with {} items", queue.items.len());
        queue
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Insert or replace the pending item for the item's entity.
    ///
    /// A create that is still pending absorbs a later update: the entity
    /// does not exist remotely yet, so it must still be created.
    pub fn enqueue(&mut self, mut item: SyncQueueItem) -> SyncResult<()> {
        let snapshot = self.items.clone();

        if let Some(pos) = self.position_for_entity(item.entity_type, &item.entity_id) {
            let previous = self.items.remove(pos);
            if previous.operation_type == OperationType::Create
                && item.operation_type == OperationType::Update
            {
                item.operation_type = OperationType::Create;
            }
            debug!(
                entity_type = %item.entity_type,
                entity_id = %item.entity_id,
                "Coalescing {} into pending {}",
                item.operation_type,
                previous.operation_type
            );
        }

        self.items.push(item);
        self.sort();
        self.commit(snapshot)
    }

    /// Next drainable item: lowest priority rank, then oldest
    pub fn get_next(&self) -> Option<&SyncQueueItem> {
        self.drainable().next()
    }

    /// Like [`get_next`](Self::get_next), skipping the given queue ids
    pub fn get_next_excluding(&self, skip: &HashSet<String>) -> Option<&SyncQueueItem> {
        self.drainable().find(|item| !skip.contains(&item.id))
    }

    /// Remove an acknowledged item
    pub fn dequeue(&mut self, id: &str) -> SyncResult<Option<SyncQueueItem>> {
        let Some(pos) = self.items.iter().position(|i| i.id == id) else {
            return Ok(None);
        };
        let snapshot = self.items.clone();
        let removed = self.items.remove(pos);
        self.commit(snapshot)?;
        Ok(Some(removed))
    }

    /// Record a failed transmission attempt. The item stays queued.
    pub fn mark_failed(&mut self, id: &str, error: &str) -> SyncResult<()> {
        let Some(pos) = self.items.iter().position(|i| i.id == id) else {
            return Ok(());
        };
        let snapshot = self.items.clone();
        let item = &mut self.items[pos];
        item.attempts += 1;
        item.last_error = Some(error.to_string());
        item.last_attempt_at = Some(Utc::now());

        if item.attempts >= self.max_attempts {
            warn!(
                entity_type = %item.entity_type,
                entity_id = %item.entity_id,
                "Queue item {} permanently failed after {} attempts: {}",
                item.id,
                item.attempts,
                error
            );
        }
        self.commit(snapshot)
    }

    pub fn get(&self, id: &str) -> Option<&SyncQueueItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn get_for_entity(&self, entity_type: EntityType, entity_id: &str) -> Option<&SyncQueueItem> {
        self.position_for_entity(entity_type, entity_id)
            .map(|pos| &self.items[pos])
    }

    pub fn get_by_entity_type(&self, entity_type: EntityType) -> Vec<SyncQueueItem> {
        self.items
            .iter()
            .filter(|i| i.entity_type == entity_type)
            .cloned()
            .collect()
    }

    pub fn get_failed_items(&self) -> Vec<SyncQueueItem> {
        self.items
            .iter()
            .filter(|i| i.is_permanently_failed(self.max_attempts))
            .cloned()
            .collect()
    }

    /// Give permanently failed items a fresh attempt budget
    pub fn retry_failed_items(&mut self) -> SyncResult<usize> {
        let snapshot = self.items.clone();
        let mut reset = 0;
        for item in self
            .items
            .iter_mut()
            .filter(|i| i.attempts >= self.max_attempts)
        {
            item.attempts = 0;
            item.last_error = None;
            reset += 1;
        }
        if reset == 0 {
            return Ok(0);
        }
        self.commit(snapshot)?;
        Ok(reset)
    }

    pub fn clear_failed_items(&mut self) -> SyncResult<usize> {
        let snapshot = self.items.clone();
        let max_attempts = self.max_attempts;
        self.items.retain(|i| !i.is_permanently_failed(max_attempts));
        let removed = snapshot.len() - self.items.len();
        if removed == 0 {
            return Ok(0);
        }
        self.commit(snapshot)?;
        Ok(removed)
    }

    pub fn clear(&mut self) -> SyncResult<()> {
        let snapshot = std::mem::take(&mut self.items);
        self.commit(snapshot)
    }

    /// Items still eligible for draining
    pub fn pending_count(&self) -> usize {
        self.drainable().count()
    }

    pub fn has_items_to_sync(&self) -> bool {
        self.get_next().is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items in draining order, failed ones included
    pub fn items(&self) -> &[SyncQueueItem] {
        &self.items
    }

    fn drainable(&self) -> impl Iterator<Item = &SyncQueueItem> {
        let max_attempts = self.max_attempts;
        self.items
            .iter()
            .filter(move |i| !i.is_permanently_failed(max_attempts))
    }

    fn position_for_entity(&self, entity_type: EntityType, entity_id: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|i| i.entity_type == entity_type && i.entity_id == entity_id)
    }

    fn sort(&mut self) {
        self.items.sort_by_key(|i| i.order_key());
    }

    /// Persist the current items, restoring `snapshot` if the write fails
    fn commit(&mut self, snapshot: Vec<SyncQueueItem>) -> SyncResult<()> {
        let result = serde_json::to_string(&self.items)
            .map_err(SyncError::from)
            .and_then(|raw| self.settings.set(QUEUE_KEY, &raw));

        if let Err(e) = result {
            warn!("Failed to persist sync queue, rolling back: {}", e);
            self.items = snapshot;
            return Err(e);
        }
        Ok(())
    }
}
