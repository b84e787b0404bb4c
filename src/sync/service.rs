//! Sync Orchestrator
//!
//! Decides when to push queued mutations and pull remote changes, reacts to
//! connectivity and app lifecycle signals, and publishes [`SyncStatus`].
//!
//! Only one run (full, push-only or download) is active at a time. Background
//! work is three tasks: the periodic timer, the debounce timer and the
//! connectivity listener. All of them hold a weak reference to the service.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::conflict::{Conflict, ConflictResolver};
use super::connectivity::Connectivity;
use super::local_store::LocalStore;
use super::queue::SyncQueue;
use super::record::{
    extract_timestamp, EntityRecord, FIELD_ID, FIELD_SERVER_VERSION, FIELD_UPDATED_AT,
};
use super::remote::{PushOutcome, RemoteApi, RemoteChange};
use super::settings::{SettingsStore, LAST_SYNC_KEY};
use super::types::{
    EntitySyncStatus, OperationType, SkipReason, SyncQueueItem, SyncReport, SyncState,
    SyncStatus,
};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Capacity of the status broadcast channel
const STATUS_CHANNEL_CAPACITY: usize = 100;

/// Cumulative counters since construction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetrics {
    pub full_runs: u64,
    pub incremental_runs: u64,
    pub downloads: u64,
    pub items_pushed: u64,
    pub items_failed: u64,
    pub conflicts_resolved: u64,
    pub changes_pulled: u64,
}

#[derive(Default)]
struct Counters {
    full_runs: AtomicU64,
    incremental_runs: AtomicU64,
    downloads: AtomicU64,
    items_pushed: AtomicU64,
    items_failed: AtomicU64,
    conflicts_resolved: AtomicU64,
    changes_pulled: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncMetrics {
        SyncMetrics {
            full_runs: self.full_runs.load(Ordering::Relaxed),
            incremental_runs: self.incremental_runs.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            items_pushed: self.items_pushed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            changes_pulled: self.changes_pulled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    /// Push, then pull since the last sync point
    Full,
    PushOnly,
    /// Pull everything
    Download,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunKind::Full => "full",
            RunKind::PushOnly => "incremental",
            RunKind::Download => "download",
        };
        f.write_str(s)
    }
}

/// Releases the single-run flag when the run ends, however it ends
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct Tasks {
    periodic: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

/// Result of applying one pulled change
enum Applied {
    Written,
    Deferred,
    Ignored,
}

pub struct SyncService {
    config: SyncConfig,
    queue: Mutex<SyncQueue>,
    settings: Arc<dyn SettingsStore>,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<dyn Connectivity>,
    resolver: Arc<dyn ConflictResolver>,
    status: RwLock<SyncStatus>,
    status_tx: broadcast::Sender<SyncStatus>,
    is_syncing: AtomicBool,
    is_online: AtomicBool,
    foreground: AtomicBool,
    disposed: AtomicBool,
    tasks: Mutex<Tasks>,
    counters: Counters,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        queue: SyncQueue,
        settings: Arc<dyn SettingsStore>,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn Connectivity>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let status = SyncStatus {
            pending_count: queue.pending_count(),
            last_sync_time: load_last_sync_time(settings.as_ref()),
            ..Default::default()
        };

        Arc::new(Self {
            config,
            queue: Mutex::new(queue),
            settings,
            local,
            remote,
            connectivity,
            resolver,
            status: RwLock::new(status),
            status_tx,
            is_syncing: AtomicBool::new(false),
            is_online: AtomicBool::new(false),
            foreground: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            tasks: Mutex::new(Tasks::default()),
            counters: Counters::default(),
        })
    }

    /// Restore persisted state, hook up connectivity, start the periodic
    /// timer and run a first full sync.
    pub async fn initialize(self: &Arc<Self>) -> SyncResult<SyncReport> {
        let online = self.refresh_connectivity().await;
        // After the probe, so its own publish is not mistaken for a reconnect
        self.start_connectivity_listener();

        self.foreground.store(true, Ordering::Release);
        self.start_periodic_timer();

        info!(
            online,
            pending = self.pending_count(),
            resolver = self.resolver.name(),
            "Sync service initialized"
        );
        self.sync_all().await
    }

    /// Probe connectivity now and settle the state accordingly.
    ///
    /// Unlike a change observed by the listener, this never starts a sync.
    pub async fn refresh_connectivity(&self) -> bool {
        let online = self.connectivity.check().await;
        self.is_online.store(online, Ordering::Release);
        if !self.is_syncing.load(Ordering::Acquire) {
            self.settle_state();
        }
        online
    }

    /// Record that a local mutation happened and schedule a debounced push
    pub fn notify_local_change(self: &Arc<Self>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        let pending_count = self.queue.lock().pending_count();
        let online = self.is_online.load(Ordering::Acquire);
        let syncing = self.is_syncing.load(Ordering::Acquire);
        self.update_status(|s| {
            s.pending_count = pending_count;
            if online && !syncing {
                s.state = SyncState::PendingChanges;
            }
        });

        self.schedule_debounced_push();
    }

    /// Enqueue a mutation and schedule its push
    pub fn queue_change(self: &Arc<Self>, item: SyncQueueItem) -> SyncResult<()> {
        debug!(
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            "Queueing {}",
            item.operation_type
        );
        self.queue.lock().enqueue(item)?;
        self.notify_local_change();
        Ok(())
    }

    /// Push all pending items, then pull changes since the last sync point
    pub async fn sync_all(&self) -> SyncResult<SyncReport> {
        self.run(RunKind::Full).await
    }

    /// Push only
    pub async fn sync_changes(&self) -> SyncResult<SyncReport> {
        self.run(RunKind::PushOnly).await
    }

    /// Pull every remote record regardless of the last sync point
    pub async fn full_download(&self) -> SyncResult<SyncReport> {
        self.run(RunKind::Download).await
    }

    pub async fn on_app_resumed(self: &Arc<Self>) -> SyncResult<SyncReport> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(SyncReport::skipped(SkipReason::Disposed));
        }
        debug!("App resumed");
        self.foreground.store(true, Ordering::Release);
        self.start_periodic_timer();
        self.sync_all().await
    }

    pub fn on_app_paused(&self) {
        debug!("App paused");
        self.foreground.store(false, Ordering::Release);
        if let Some(handle) = self.tasks.lock().periodic.take() {
            handle.abort();
        }
    }

    /// Stop all background work. Later triggers are no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = self.tasks.lock();
        for handle in [
            tasks.periodic.take(),
            tasks.debounce.take(),
            tasks.listener.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        info!("Sync service disposed");
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    /// Receive every status change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.counters.snapshot()
    }

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().pending_count()
    }

    /// Snapshot of all queued items in draining order
    pub fn queued_items(&self) -> Vec<SyncQueueItem> {
        self.queue.lock().items().to_vec()
    }

    pub fn failed_items(&self) -> Vec<SyncQueueItem> {
        self.queue.lock().get_failed_items()
    }

    /// Give permanently failed items another round of attempts
    pub fn retry_failed_items(&self) -> SyncResult<usize> {
        let reset = self.queue.lock().retry_failed_items()?;
        if reset > 0 {
            info!("Re-queued {} failed items", reset);
            self.refresh_pending();
        }
        Ok(reset)
    }

    pub fn clear_failed_items(&self) -> SyncResult<usize> {
        let removed = self.queue.lock().clear_failed_items()?;
        if removed > 0 {
            info!("Dropped {} failed items", removed);
            self.refresh_pending();
        }
        Ok(removed)
    }

    // ==================== Runs ====================

    async fn run(&self, kind: RunKind) -> SyncResult<SyncReport> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(SyncReport::skipped(SkipReason::Disposed));
        }
        if !self.is_online.load(Ordering::Acquire) {
            debug!("Skipping {} sync: offline", kind);
            return Ok(SyncReport::skipped(SkipReason::Offline));
        }
        let Some(_guard) = RunGuard::acquire(&self.is_syncing) else {
            debug!("Skipping {} sync: already syncing", kind);
            return Ok(SyncReport::skipped(SkipReason::AlreadySyncing));
        };

        match kind {
            RunKind::Full => Counters::bump(&self.counters.full_runs, 1),
            RunKind::PushOnly => Counters::bump(&self.counters.incremental_runs, 1),
            RunKind::Download => Counters::bump(&self.counters.downloads, 1),
        }

        self.update_status(|s| {
            s.state = SyncState::Syncing;
            s.is_syncing = true;
        });
        debug!("Starting {} sync", kind);

        let mut report = SyncReport::default();
        let result = match kind {
            RunKind::Full => self.run_full(&mut report).await,
            RunKind::PushOnly => self.push_pending(&mut report).await,
            RunKind::Download => self.pull_and_apply(None, &mut report).await,
        };

        match result {
            Ok(()) => {
                self.settle_state();
                info!(
                    pushed = report.pushed,
                    conflicts = report.conflicts,
                    failed = report.failed,
                    pulled = report.pulled,
                    deferred = report.deferred,
                    "{} sync complete",
                    kind
                );
                Ok(report)
            }
            Err(e) => {
                error!("{} sync failed: {}", kind, e);
                let message = e.to_string();
                let pending_count = self.queue.lock().pending_count();
                let online = self.is_online.load(Ordering::Acquire);
                self.update_status(|s| {
                    s.state = if online {
                        SyncState::Error
                    } else {
                        SyncState::Offline
                    };
                    s.error_message = Some(message);
                    s.is_syncing = false;
                    s.pending_count = pending_count;
                });
                Err(e)
            }
        }
    }

    async fn run_full(&self, report: &mut SyncReport) -> SyncResult<()> {
        self.push_pending(report).await?;
        let since = self.status.read().last_sync_time;
        self.pull_and_apply(since, report).await
    }

    // ==================== Push ====================

    async fn push_pending(&self, report: &mut SyncReport) -> SyncResult<()> {
        let mut attempted = HashSet::new();

        loop {
            // Re-read every iteration so urgent items enqueued mid-cycle go next
            let next = self.queue.lock().get_next_excluding(&attempted).cloned();
            let Some(item) = next else { break };
            attempted.insert(item.id.clone());

            match self.remote.push(&item).await {
                Ok(PushOutcome::Accepted(body)) => {
                    self.acknowledge(&item, server_version_of(body.as_ref())).await?;
                    report.pushed += 1;
                }
                Ok(PushOutcome::Conflict(body)) => {
                    if self.handle_conflict(&item, body).await? {
                        report.conflicts += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Err(e) if e.is_network() => {
                    warn!(
                        entity_type = %item.entity_type,
                        entity_id = %item.entity_id,
                        queue_id = %item.id,
                        "Push failed, will retry: {}",
                        e
                    );
                    self.record_failure(&item, &e.to_string())?;
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }

            self.refresh_pending_count();
        }

        Ok(())
    }

    /// A newer mutation for the same entity replaced this item while it
    /// was in flight.
    fn is_superseded(&self, item: &SyncQueueItem) -> bool {
        self.queue
            .lock()
            .get_for_entity(item.entity_type, &item.entity_id)
            .is_some_and(|current| current.id != item.id)
    }

    async fn acknowledge(
        &self,
        item: &SyncQueueItem,
        server_version: Option<u64>,
    ) -> SyncResult<()> {
        if item.operation_type != OperationType::Delete && !self.is_superseded(item) {
            self.local
                .mark_synced(item.entity_type, &item.entity_id, server_version)
                .await?;
        }

        self.queue.lock().dequeue(&item.id)?;
        Counters::bump(&self.counters.items_pushed, 1);
        debug!(
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            server_version = ?server_version,
            "Pushed {}",
            item.operation_type
        );
        Ok(())
    }

    fn record_failure(&self, item: &SyncQueueItem, message: &str) -> SyncResult<()> {
        self.queue.lock().mark_failed(&item.id, message)?;
        Counters::bump(&self.counters.items_failed, 1);
        Ok(())
    }

    /// Resolve a 409. Returns `false` when the item stays queued for a later
    /// attempt.
    async fn handle_conflict(&self, item: &SyncQueueItem, body: Option<Value>) -> SyncResult<bool> {
        let server_value = match self.remote.fetch(item.entity_type, &item.entity_id).await {
            Ok(Some(value)) => Some(value),
            Ok(None) => body,
            Err(e) => {
                debug!(entity_id = %item.entity_id, "Refetch after conflict failed: {}", e);
                body
            }
        };

        let Some(server_value) = server_value else {
            warn!(
                entity_type = %item.entity_type,
                entity_id = %item.entity_id,
                "Conflict without a server record"
            );
            self.record_failure(item, "conflict without server record")?;
            return Ok(false);
        };
        let remote =
            EntityRecord::from_wire(item.entity_type, &with_id(server_value, &item.entity_id))?;
        let local = self.local_side(item).await?;

        let conflict = Conflict::from_records(&local, &remote);
        let resolution = self.resolver.resolve(&conflict);
        Counters::bump(&self.counters.conflicts_resolved, 1);

        if !resolution.local_won {
            info!(
                entity_type = %item.entity_type,
                entity_id = %item.entity_id,
                "Conflict resolved: server wins"
            );
            self.apply_server_record(item, remote).await?;
            self.queue.lock().dequeue(&item.id)?;
            return Ok(true);
        }

        info!(
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            server_version = resolution.server_version,
            "Conflict resolved: local wins, re-pushing"
        );

        let mut repush = item.clone();
        if repush.operation_type == OperationType::Create {
            repush.operation_type = OperationType::Update;
        }
        if repush.operation_type != OperationType::Delete {
            // Re-send the queued mutation itself, never the stored record
            let mut data = item.payload.clone().unwrap_or_default();
            data.insert(
                FIELD_SERVER_VERSION.to_string(),
                Value::from(resolution.server_version),
            );
            data.entry(FIELD_UPDATED_AT.to_string())
                .or_insert_with(|| Value::String(conflict.local_updated_at.to_rfc3339()));
            repush.payload = Some(data);
        }

        match self.remote.push(&repush).await {
            Ok(PushOutcome::Accepted(body)) => {
                let version =
                    server_version_of(body.as_ref()).unwrap_or(resolution.server_version);
                self.acknowledge(item, Some(version)).await?;
                Ok(true)
            }
            Ok(PushOutcome::Conflict(body)) => {
                // Second conflict in a row: stop arguing and take the server's copy
                warn!(
                    entity_type = %item.entity_type,
                    entity_id = %item.entity_id,
                    "Re-push conflicted again, applying server record"
                );
                let latest = body
                    .and_then(|value| {
                        EntityRecord::from_wire(item.entity_type, &with_id(value, &item.entity_id))
                            .ok()
                    })
                    .unwrap_or(remote);
                self.apply_server_record(item, latest).await?;
                self.queue.lock().dequeue(&item.id)?;
                Ok(true)
            }
            Err(e) if e.is_network() => {
                warn!(entity_id = %item.entity_id, "Re-push failed, will retry: {}", e);
                self.record_failure(item, &e.to_string())?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Local side of a conflict: the stored record, or the queued payload
    /// when the record is gone (deleted locally).
    async fn local_side(&self, item: &SyncQueueItem) -> SyncResult<EntityRecord> {
        if let Some(record) = self.local.get(item.entity_type, &item.entity_id).await? {
            return Ok(record);
        }

        let payload = Value::Object(item.payload.clone().unwrap_or_default());
        let payload = with_id(payload, &item.entity_id);
        let mut record = EntityRecord::from_wire(item.entity_type, &payload)?;
        if extract_timestamp(&payload).is_none() {
            record.updated_at = item.queued_at;
        }
        record.sync_status = EntitySyncStatus::Pending;
        Ok(record)
    }

    async fn apply_server_record(
        &self,
        item: &SyncQueueItem,
        mut record: EntityRecord,
    ) -> SyncResult<()> {
        if self.is_superseded(item) {
            debug!(entity_id = %item.entity_id, "Newer local edit queued, keeping it");
            return Ok(());
        }
        record.sync_status = EntitySyncStatus::Synced;
        record.deleted = false;
        match self.local.get(record.entity_type, &record.id).await? {
            Some(_) => self.local.update(&record).await,
            None => self.local.insert(&record).await,
        }
    }

    // ==================== Pull ====================

    async fn pull_and_apply(
        &self,
        since: Option<DateTime<Utc>>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        // Changes committed while the request is in flight are fetched again next time
        let issued_at = Utc::now();
        let changes = self.remote.pull(since).await?;
        debug!(count = changes.len(), since = ?since, "Pulled remote changes");

        for change in changes {
            match self.apply_remote_change(change).await? {
                Applied::Written => report.pulled += 1,
                Applied::Deferred => report.deferred += 1,
                Applied::Ignored => {}
            }
        }
        Counters::bump(&self.counters.changes_pulled, report.pulled as u64);

        self.store_last_sync_time(issued_at)?;
        Ok(())
    }

    async fn apply_remote_change(&self, change: RemoteChange) -> SyncResult<Applied> {
        let entity_type = change.entity_type;
        let existing = self.local.get(entity_type, &change.entity_id).await?;
        let queued = self
            .queue
            .lock()
            .get_for_entity(entity_type, &change.entity_id)
            .is_some();
        let local_is_clean = existing
            .as_ref()
            .is_some_and(|r| r.sync_status == EntitySyncStatus::Synced)
            && !queued;

        if change.deleted {
            return match existing {
                None => Ok(Applied::Ignored),
                Some(_) if local_is_clean => {
                    self.local.soft_delete(entity_type, &change.entity_id).await?;
                    Ok(Applied::Written)
                }
                Some(_) => Ok(Applied::Deferred),
            };
        }

        if !change.data.is_object() {
            return Err(SyncError::InvalidRecord(format!(
                "{} '{}' change carries no object",
                entity_type, change.entity_id
            )));
        }
        let mut record =
            EntityRecord::from_wire(entity_type, &with_id(change.data, &change.entity_id))?;
        if change.server_version.is_some() {
            record.server_version = change.server_version;
        }

        match existing {
            None if queued => Ok(Applied::Deferred),
            None => {
                self.local.insert(&record).await?;
                Ok(Applied::Written)
            }
            Some(_) if local_is_clean => {
                self.local.update(&record).await?;
                Ok(Applied::Written)
            }
            Some(_) => {
                debug!(
                    entity_type = %entity_type,
                    entity_id = %record.id,
                    "Deferring remote change, local edit pending"
                );
                Ok(Applied::Deferred)
            }
        }
    }

    fn store_last_sync_time(&self, at: DateTime<Utc>) -> SyncResult<()> {
        self.settings.set(LAST_SYNC_KEY, &at.to_rfc3339())?;
        self.update_status(|s| s.last_sync_time = Some(at));
        Ok(())
    }

    // ==================== Status ====================

    fn update_status<F: FnOnce(&mut SyncStatus)>(&self, f: F) {
        let snapshot = {
            let mut status = self.status.write();
            f(&mut status);
            status.clone()
        };
        // No subscribers is fine
        let _ = self.status_tx.send(snapshot);
    }

    /// Resting state after a run or a connectivity change
    fn settle_state(&self) {
        let pending_count = self.queue.lock().pending_count();
        let online = self.is_online.load(Ordering::Acquire);
        self.update_status(|s| {
            s.state = if !online {
                SyncState::Offline
            } else if pending_count > 0 {
                SyncState::PendingChanges
            } else {
                SyncState::Idle
            };
            s.pending_count = pending_count;
            s.is_syncing = false;
            s.error_message = None;
        });
    }

    fn refresh_pending_count(&self) {
        let pending_count = self.queue.lock().pending_count();
        self.update_status(|s| s.pending_count = pending_count);
    }

    /// Recount after a queue maintenance action, re-deriving a resting state
    fn refresh_pending(&self) {
        let pending_count = self.queue.lock().pending_count();
        let online = self.is_online.load(Ordering::Acquire);
        self.update_status(|s| {
            s.pending_count = pending_count;
            if online && matches!(s.state, SyncState::Idle | SyncState::PendingChanges) {
                s.state = if pending_count > 0 {
                    SyncState::PendingChanges
                } else {
                    SyncState::Idle
                };
            }
        });
    }

    // ==================== Background tasks ====================

    fn schedule_debounced_push(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.config.debounce;
        let mut tasks = self.tasks.lock();
        if let Some(previous) = tasks.debounce.take() {
            previous.abort();
        }
        tasks.debounce = Some(tokio::spawn(async move {
            sleep(delay).await;
            let Some(service) = weak.upgrade() else { return };
            // Detached so a later abort of this timer never cancels the push
            tokio::spawn(async move {
                if let Err(e) = service.sync_changes().await {
                    warn!("Debounced push failed: {}", e);
                }
            });
        }));
    }

    fn start_periodic_timer(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.periodic.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.interval;
        tasks.periodic = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else { break };
                if !service.foreground.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(e) = service.sync_all().await {
                    warn!("Periodic sync failed: {}", e);
                }
            }
        }));
    }

    fn start_connectivity_listener(self: &Arc<Self>) {
        let mut rx = self.connectivity.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut tasks = self.tasks.lock();
        if let Some(previous) = tasks.listener.take() {
            previous.abort();
        }
        tasks.listener = Some(tokio::spawn(async move {
            // Catch a change that landed between the probe and the subscription
            let current = *rx.borrow_and_update();
            match weak.upgrade() {
                Some(service) => service.handle_connectivity(current),
                None => return,
            }
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                let Some(service) = weak.upgrade() else { break };
                service.handle_connectivity(online);
            }
        }));
    }

    fn handle_connectivity(self: &Arc<Self>, online: bool) {
        let was_online = self.is_online.swap(online, Ordering::AcqRel);
        if online == was_online {
            return;
        }

        if !online {
            info!("Connection lost, going offline");
            self.update_status(|s| s.state = SyncState::Offline);
            return;
        }

        info!("Connection restored, syncing");
        if self.is_syncing.load(Ordering::Acquire) {
            // The run in flight settles the state when it ends
            self.update_status(|s| s.state = SyncState::Syncing);
        } else {
            self.settle_state();
        }
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.sync_all().await {
                warn!("Sync after reconnect failed: {}", e);
            }
        });
    }
}

fn load_last_sync_time(settings: &dyn SettingsStore) -> Option<DateTime<Utc>> {
    match settings.get(LAST_SYNC_KEY) {
        Ok(Some(raw)) => match DateTime::parse_from_rfc3339(&raw) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(e) => {
                warn!("Ignoring unreadable last sync time '{}': {}", raw, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("Failed to read last sync time: {}", e);
            None
        }
    }
}

fn server_version_of(body: Option<&Value>) -> Option<u64> {
    body.and_then(|b| b.get(FIELD_SERVER_VERSION))
        .and_then(Value::as_u64)
}

/// Server bodies may omit the id the request was addressed by
fn with_id(mut value: Value, id: &str) -> Value {
    if let Value::Object(obj) = &mut value {
        obj.entry(FIELD_ID.to_string())
            .or_insert_with(|| Value::String(id.to_string()));
    }
    value
}

impl Drop for SyncService {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for handle in [
            tasks.periodic.take(),
            tasks.debounce.take(),
            tasks.listener.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}
