//! Common test utilities for sync engine tests
//!
//! Provides shared helpers for:
//! - A scripted in-process remote, optionally holding pushes at a gate
//! - Settings storage that can be told to fail
//! - Building a service over an in-memory SQLite store

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use journal_sync::config::SyncConfig;
use journal_sync::error::{SyncError, SyncResult};
use journal_sync::sync::{
    Connectivity, EntityRecord, EntityType, LastWriteWinsResolver, LocalStore, ManualConnectivity,
    OperationType, PushOutcome, RemoteApi, RemoteChange, SettingsStore, SqliteStore, SyncQueue,
    SyncQueueItem, SyncService,
};

/// What the fake server answers to a push
#[derive(Debug, Clone)]
pub enum Scripted {
    Accept(Option<Value>),
    Conflict(Option<Value>),
    NetworkError,
    HttpError(u16),
}

/// In-process remote answering from per-entity scripts.
///
/// Unscripted pushes are accepted with `serverVersion: 1`.
#[derive(Default)]
pub struct FakeRemote {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    pushes: Mutex<Vec<SyncQueueItem>>,
    records: Mutex<HashMap<String, Value>>,
    changes: Mutex<Vec<RemoteChange>>,
    pull_calls: Mutex<Vec<Option<DateTime<Utc>>>>,
    pull_error: Mutex<Option<u16>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, entity_id: &str, answers: Vec<Scripted>) {
        self.scripts
            .lock()
            .insert(entity_id.to_string(), answers.into());
    }

    /// Record returned by `fetch`
    pub fn set_record(&self, entity_id: &str, value: Value) {
        self.records.lock().insert(entity_id.to_string(), value);
    }

    pub fn set_changes(&self, changes: Vec<RemoteChange>) {
        *self.changes.lock() = changes;
    }

    pub fn fail_pull(&self, status: u16) {
        *self.pull_error.lock() = Some(status);
    }

    /// Hold every push until [`FakeRemote::release`] lets it through.
    /// The push is recorded before it waits.
    pub fn hold_pushes(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, pushes: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(pushes);
        }
    }

    pub fn pushes(&self) -> Vec<SyncQueueItem> {
        self.pushes.lock().clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }

    pub fn pull_calls(&self) -> Vec<Option<DateTime<Utc>>> {
        self.pull_calls.lock().clone()
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn push(&self, item: &SyncQueueItem) -> SyncResult<PushOutcome> {
        self.pushes.lock().push(item.clone());
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate open").forget();
        }
        let answer = self
            .scripts
            .lock()
            .get_mut(&item.entity_id)
            .and_then(|answers| answers.pop_front());

        match answer {
            None => Ok(PushOutcome::Accepted(Some(
                json!({"id": item.entity_id, "serverVersion": 1}),
            ))),
            Some(Scripted::Accept(body)) => Ok(PushOutcome::Accepted(body)),
            Some(Scripted::Conflict(body)) => Ok(PushOutcome::Conflict(body)),
            Some(Scripted::NetworkError) => Err(SyncError::Network("connection reset".into())),
            Some(Scripted::HttpError(status)) => Err(SyncError::http(status, "rejected")),
        }
    }

    async fn fetch(&self, _entity_type: EntityType, id: &str) -> SyncResult<Option<Value>> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn pull(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<RemoteChange>> {
        self.pull_calls.lock().push(since);
        if let Some(status) = *self.pull_error.lock() {
            return Err(SyncError::http(status, "pull rejected"));
        }
        Ok(self.changes.lock().clone())
    }
}

/// Settings storage whose writes can be switched off
#[derive(Default)]
pub struct FlakySettings {
    values: Mutex<HashMap<String, String>>,
    fail_writes: Mutex<bool>,
}

impl FlakySettings {
    pub fn set_failing(&self, failing: bool) {
        *self.fail_writes.lock() = failing;
    }
}

impl SettingsStore for FlakySettings {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        if *self.fail_writes.lock() {
            return Err(SyncError::Storage("disk full".into()));
        }
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

pub fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object literal")
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        interval: Duration::from_secs(300),
        debounce: Duration::from_millis(2000),
        ..Default::default()
    }
}

pub struct Harness {
    pub service: Arc<SyncService>,
    pub store: Arc<SqliteStore>,
    pub remote: Arc<FakeRemote>,
    pub connectivity: Arc<ManualConnectivity>,
}

/// Service over an in-memory store with a fake remote
pub fn harness(online: bool) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store"));
    harness_on(store, online)
}

/// Service over an existing store, picking up its persisted state
pub fn harness_on(store: Arc<SqliteStore>, online: bool) -> Harness {
    let remote = FakeRemote::new();
    let connectivity = Arc::new(ManualConnectivity::new(online));
    let service = build_service(store.clone(), remote.clone(), connectivity.clone());

    Harness {
        service,
        store,
        remote,
        connectivity,
    }
}

pub fn build_service(
    store: Arc<SqliteStore>,
    remote: Arc<FakeRemote>,
    connectivity: Arc<dyn Connectivity>,
) -> Arc<SyncService> {
    let settings: Arc<dyn SettingsStore> = store.clone();
    let local: Arc<dyn LocalStore> = store;
    let queue = SyncQueue::load(settings.clone(), test_config().max_attempts);

    SyncService::new(
        test_config(),
        queue,
        settings,
        local,
        remote,
        connectivity,
        Arc::new(LastWriteWinsResolver),
    )
}

/// Connectivity that publishes the outcome of each probe on its channel
/// before answering, the way a polling health check does.
pub struct PublishingProbe {
    reachable: bool,
    tx: watch::Sender<bool>,
}

impl PublishingProbe {
    pub fn new(reachable: bool) -> Self {
        let (tx, _) = watch::channel(false);
        Self { reachable, tx }
    }
}

#[async_trait]
impl Connectivity for PublishingProbe {
    async fn check(&self) -> bool {
        self.tx.send_replace(self.reachable);
        // Give listeners a chance to react before the caller sees the answer
        tokio::task::yield_now().await;
        self.reachable
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Yield to background tasks until `condition` holds, failing after 5s
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Write a pending local record and build the matching queue item
pub async fn local_edit(
    store: &SqliteStore,
    entity_type: EntityType,
    id: &str,
    data: Value,
    updated_at: DateTime<Utc>,
) -> SyncQueueItem {
    let record = EntityRecord::pending(entity_type, id, obj(data), updated_at);
    store.insert(&record).await.expect("insert local record");
    let payload = record.to_wire().as_object().cloned();
    SyncQueueItem::local_edit(entity_type, id, OperationType::Update, payload)
}

/// Write an already synced local record
pub async fn synced_record(
    store: &SqliteStore,
    entity_type: EntityType,
    id: &str,
    data: Value,
    server_version: u64,
) {
    let mut record = EntityRecord::pending(entity_type, id, obj(data), Utc::now());
    record.server_version = Some(server_version);
    record.sync_status = journal_sync::sync::EntitySyncStatus::Synced;
    store.insert(&record).await.expect("insert synced record");
}
