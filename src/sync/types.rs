//! Sync data types
//!
//! Defines the queue item, the priority ladder and the observable status
//! shared by the queue, the resolver and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Domain record kinds that participate in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    JournalEntry,
    WeeklyBrief,
    Problem,
    BoardMember,
    Bet,
    GovernanceSession,
    EvidenceItem,
    ReSetupTrigger,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::JournalEntry,
        EntityType::WeeklyBrief,
        EntityType::Problem,
        EntityType::BoardMember,
        EntityType::Bet,
        EntityType::GovernanceSession,
        EntityType::EvidenceItem,
        EntityType::ReSetupTrigger,
    ];

    /// Wire name, also used as the storage discriminator
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::JournalEntry => "journal-entry",
            EntityType::WeeklyBrief => "weekly-brief",
            EntityType::Problem => "problem",
            EntityType::BoardMember => "board-member",
            EntityType::Bet => "bet",
            EntityType::GovernanceSession => "governance-session",
            EntityType::EvidenceItem => "evidence-item",
            EntityType::ReSetupTrigger => "re-setup-trigger",
        }
    }

    /// REST collection segment for this entity type
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::JournalEntry => "journal-entries",
            EntityType::WeeklyBrief => "weekly-briefs",
            EntityType::Problem => "problems",
            EntityType::BoardMember => "board-members",
            EntityType::Bet => "bets",
            EntityType::GovernanceSession => "governance-sessions",
            EntityType::EvidenceItem => "evidence-items",
            EntityType::ReSetupTrigger => "re-setup-triggers",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mutation carried by a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    /// Upload of a derived artifact (e.g. a transcription result)
    AiProcess,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::AiProcess => "ai-process",
        };
        f.write_str(s)
    }
}

/// Draining rank. Lower value drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SyncPriority {
    AuthRefresh = 1,
    Transcription = 2,
    SignalExtraction = 3,
    LocalEdits = 4,
    ServerDownload = 5,
}

impl From<SyncPriority> for u8 {
    fn from(p: SyncPriority) -> u8 {
        p as u8
    }
}

impl TryFrom<u8> for SyncPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SyncPriority::AuthRefresh),
            2 => Ok(SyncPriority::Transcription),
            3 => Ok(SyncPriority::SignalExtraction),
            4 => Ok(SyncPriority::LocalEdits),
            5 => Ok(SyncPriority::ServerDownload),
            other => Err(format!("unknown sync priority {}", other)),
        }
    }
}

/// A pending mutation awaiting transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    /// Queue entry id, distinct from the entity id
    pub id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub operation_type: OperationType,
    pub priority: SyncPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation_type: OperationType,
        priority: SyncPriority,
        payload: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            entity_type,
            operation_type,
            priority,
            payload,
            queued_at: Utc::now(),
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    /// Local edit of an entity at the default priority
    pub fn local_edit(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation_type: OperationType,
        payload: Option<Map<String, Value>>,
    ) -> Self {
        Self::new(
            entity_type,
            entity_id,
            operation_type,
            SyncPriority::LocalEdits,
            payload,
        )
    }

    pub fn with_queued_at(mut self, queued_at: DateTime<Utc>) -> Self {
        self.queued_at = queued_at;
        self
    }

    pub fn is_permanently_failed(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    /// Draining order key: priority, then FIFO
    pub(crate) fn order_key(&self) -> (SyncPriority, DateTime<Utc>) {
        (self.priority, self.queued_at)
    }
}

/// Sync state of a domain record as stored locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitySyncStatus {
    Pending,
    Synced,
    Conflict,
}

impl EntitySyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySyncStatus::Pending => "pending",
            EntitySyncStatus::Synced => "synced",
            EntitySyncStatus::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntitySyncStatus::Pending),
            "synced" => Some(EntitySyncStatus::Synced),
            "conflict" => Some(EntitySyncStatus::Conflict),
            _ => None,
        }
    }
}

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
    Offline,
    PendingChanges,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
            SyncState::Offline => "offline",
            SyncState::PendingChanges => "pendingChanges",
        };
        f.write_str(s)
    }
}

/// Observable sync status published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub pending_count: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub is_syncing: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            pending_count: 0,
            last_sync_time: None,
            error_message: None,
            is_syncing: false,
        }
    }
}

/// Why a sync request did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
    /// The service was shut down
    Disposed,
}

/// Summary of one sync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub pulled: usize,
    /// Remote changes left alone because a local edit is still pending
    pub deferred: usize,
    pub skipped: Option<SkipReason>,
}

impl SyncReport {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn ran(&self) -> bool {
        self.skipped.is_none()
    }
}
