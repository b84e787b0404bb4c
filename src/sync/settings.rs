//! Key-value settings storage used for the engine's own persisted state
//! (queue snapshot and last sync time).

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::SyncResult;

/// Settings key holding the serialized queue
pub const QUEUE_KEY: &str = "sync_queue";
/// Settings key holding the last successful sync point (RFC 3339)
pub const LAST_SYNC_KEY: &str = "last_sync_time";

/// Simple durable key-value storage
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    fn remove(&self, key: &str) -> SyncResult<()>;
}

/// Process-local settings, lost on exit
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.values
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}
