//! Durable queue behaviour across restarts and storage failures

mod common;

use chrono::{Duration, Utc};
use common::{obj, FlakySettings};
use journal_sync::sync::settings::QUEUE_KEY;
use journal_sync::sync::{
    EntityType, MemorySettings, OperationType, SettingsStore, SqliteStore, SyncPriority,
    SyncQueue, SyncQueueItem, DEFAULT_MAX_ATTEMPTS,
};
use serde_json::json;
use std::sync::Arc;

fn edit(entity_type: EntityType, id: &str, priority: SyncPriority) -> SyncQueueItem {
    SyncQueueItem::new(
        entity_type,
        id,
        OperationType::Update,
        priority,
        Some(obj(json!({"content": id}))),
    )
}

#[test]
fn test_priority_then_fifo_scenario() {
    let settings = Arc::new(MemorySettings::new());
    let mut queue = SyncQueue::load(settings, DEFAULT_MAX_ATTEMPTS);

    let item_a = edit(EntityType::JournalEntry, "entry-a", SyncPriority::LocalEdits);
    let item_b = edit(EntityType::JournalEntry, "entry-b", SyncPriority::Transcription);
    let a_id = item_a.id.clone();
    let b_id = item_b.id.clone();

    queue.enqueue(item_a).unwrap();
    queue.enqueue(item_b).unwrap();
    assert_eq!(queue.get_next().unwrap().id, b_id);

    queue.dequeue(&b_id).unwrap();
    assert_eq!(queue.get_next().unwrap().id, a_id);

    for _ in 0..5 {
        queue.mark_failed(&a_id, "timeout").unwrap();
    }
    assert!(queue.get_next().is_none());
    let failed = queue.get_failed_items();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, a_id);
    assert_eq!(failed[0].last_error.as_deref(), Some("timeout"));
    assert!(failed[0].last_attempt_at.is_some());
}

#[test]
fn test_drain_order_mixed_priorities() {
    let settings = Arc::new(MemorySettings::new());
    let mut queue = SyncQueue::load(settings, DEFAULT_MAX_ATTEMPTS);
    let now = Utc::now();

    let entries = [
        ("download", SyncPriority::ServerDownload, 0),
        ("edit-old", SyncPriority::LocalEdits, -30),
        ("signals", SyncPriority::SignalExtraction, 0),
        ("edit-new", SyncPriority::LocalEdits, -10),
        ("auth", SyncPriority::AuthRefresh, 0),
    ];
    for (id, priority, offset) in entries {
        queue
            .enqueue(edit(EntityType::Problem, id, priority).with_queued_at(now + Duration::seconds(offset)))
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(next) = queue.get_next().cloned() {
        order.push(next.entity_id.clone());
        queue.dequeue(&next.id).unwrap();
    }
    assert_eq!(order, vec!["auth", "signals", "edit-old", "edit-new", "download"]);
}

#[test]
fn test_coalescing_keeps_one_item_per_entity() {
    let settings = Arc::new(MemorySettings::new());
    let mut queue = SyncQueue::load(settings, DEFAULT_MAX_ATTEMPTS);

    for i in 0..10 {
        queue
            .enqueue(SyncQueueItem::local_edit(
                EntityType::JournalEntry,
                "entry-1",
                OperationType::Update,
                Some(obj(json!({"content": format!("draft {}", i)}))),
            ))
            .unwrap();
    }

    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get_next().unwrap().payload.as_ref().unwrap()["content"], "draft 9");
}

#[test]
fn test_delete_replaces_pending_update() {
    let settings = Arc::new(MemorySettings::new());
    let mut queue = SyncQueue::load(settings, DEFAULT_MAX_ATTEMPTS);

    queue
        .enqueue(edit(EntityType::Bet, "bet-1", SyncPriority::LocalEdits))
        .unwrap();
    queue
        .enqueue(SyncQueueItem::local_edit(
            EntityType::Bet,
            "bet-1",
            OperationType::Delete,
            None,
        ))
        .unwrap();

    let pending = queue.get_for_entity(EntityType::Bet, "bet-1").unwrap();
    assert_eq!(pending.operation_type, OperationType::Delete);
    assert!(pending.payload.is_none());
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_restart_rebuilds_pending_set() {
    let dir = tempfile::TempDir::new().unwrap();
    let expected;
    {
        let store: Arc<dyn SettingsStore> = Arc::new(SqliteStore::open_in_dir(dir.path()).unwrap());
        let mut queue = SyncQueue::load(store, DEFAULT_MAX_ATTEMPTS);
        queue
            .enqueue(edit(EntityType::WeeklyBrief, "wb-1", SyncPriority::LocalEdits))
            .unwrap();
        queue
            .enqueue(edit(EntityType::EvidenceItem, "ev-1", SyncPriority::Transcription))
            .unwrap();
        let failing = edit(EntityType::BoardMember, "bm-1", SyncPriority::SignalExtraction);
        let failing_id = failing.id.clone();
        queue.enqueue(failing).unwrap();
        queue.mark_failed(&failing_id, "HTTP timeout").unwrap();
        expected = queue.items().to_vec();
    }

    let store: Arc<dyn SettingsStore> = Arc::new(SqliteStore::open_in_dir(dir.path()).unwrap());
    let queue = SyncQueue::load(store, DEFAULT_MAX_ATTEMPTS);
    assert_eq!(queue.items(), expected.as_slice());
    assert_eq!(queue.get_next().unwrap().entity_id, "ev-1");
}

#[test]
fn test_corrupted_snapshot_resets_to_empty() {
    let settings = Arc::new(MemorySettings::new());
    settings.set(QUEUE_KEY, "{not json").unwrap();

    let mut queue = SyncQueue::load(settings.clone(), DEFAULT_MAX_ATTEMPTS);
    assert!(queue.is_empty());

    // Still usable afterwards
    queue
        .enqueue(edit(EntityType::Problem, "p-1", SyncPriority::LocalEdits))
        .unwrap();
    let raw = settings.get(QUEUE_KEY).unwrap().unwrap();
    assert!(raw.starts_with('['));
}

#[test]
fn test_failed_write_rolls_back_enqueue() {
    let settings = Arc::new(FlakySettings::default());
    let mut queue = SyncQueue::load(settings.clone(), DEFAULT_MAX_ATTEMPTS);
    queue
        .enqueue(edit(EntityType::JournalEntry, "kept", SyncPriority::LocalEdits))
        .unwrap();

    settings.set_failing(true);
    let result = queue.enqueue(edit(EntityType::JournalEntry, "lost", SyncPriority::LocalEdits));
    assert!(result.is_err());
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get_next().unwrap().entity_id, "kept");

    let kept_id = queue.get_next().unwrap().id.clone();
    assert!(queue.mark_failed(&kept_id, "boom").is_err());
    assert_eq!(queue.get(&kept_id).unwrap().attempts, 0);

    settings.set_failing(false);
    let reloaded = SyncQueue::load(settings, DEFAULT_MAX_ATTEMPTS);
    assert_eq!(reloaded.len(), 1);
}

#[test]
fn test_custom_attempt_cap() {
    let settings = Arc::new(MemorySettings::new());
    let mut queue = SyncQueue::load(settings, 2);
    let item = edit(EntityType::ReSetupTrigger, "rt-1", SyncPriority::LocalEdits);
    let id = item.id.clone();
    queue.enqueue(item).unwrap();

    queue.mark_failed(&id, "one").unwrap();
    assert!(queue.has_items_to_sync());
    queue.mark_failed(&id, "two").unwrap();
    assert!(!queue.has_items_to_sync());
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.len(), 1);
}
