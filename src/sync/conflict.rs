//! Conflict Resolution for Offline Sync
//!
//! When the server rejects a push with a version conflict, the orchestrator
//! captures both sides in a [`Conflict`] and asks a resolver which one wins.
//! Resolvers are pure decision functions: applying the decision (writing the
//! local store or re-pushing) is the orchestrator's job.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use super::record::{EntityRecord, FIELD_SERVER_VERSION};
use super::types::EntityType;

/// Both sides of a rejected push
#[derive(Debug, Clone)]
pub struct Conflict {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub local_data: Map<String, Value>,
    pub local_updated_at: DateTime<Utc>,
    /// Server version the local edit was based on, if any
    pub local_version: Option<u64>,
    pub remote_data: Map<String, Value>,
    pub remote_updated_at: DateTime<Utc>,
    pub remote_version: u64,
}

impl Conflict {
    /// Build a conflict from the local record and the server's current record
    pub fn from_records(local: &EntityRecord, remote: &EntityRecord) -> Self {
        Self {
            entity_id: local.id.clone(),
            entity_type: local.entity_type,
            local_data: local.data.clone(),
            local_updated_at: local.updated_at,
            local_version: local.server_version,
            remote_data: remote.data.clone(),
            remote_updated_at: remote.updated_at,
            remote_version: remote.server_version.unwrap_or(0),
        }
    }
}

/// Outcome of a conflict decision
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub local_won: bool,
    /// Data to re-push (local won) or to store locally (server won)
    pub winning_data: Map<String, Value>,
    /// Server version the winning data is based on
    pub server_version: u64,
}

/// Strategy deciding which side of a conflict wins
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> Resolution;

    /// Get the name of this resolver
    fn name(&self) -> &'static str;
}

/// Last-write-wins on the entity's own modification time.
///
/// Ties go to the server, which owns version numbering.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWinsResolver;

impl ConflictResolver for LastWriteWinsResolver {
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        let local_won = conflict.local_updated_at > conflict.remote_updated_at;

        debug!(
            entity_type = %conflict.entity_type,
            entity_id = %conflict.entity_id,
            local = %conflict.local_updated_at,
            remote = %conflict.remote_updated_at,
            "Resolved conflict in favour of {}",
            if local_won { "local" } else { "server" }
        );

        if local_won {
            let mut data = conflict.local_data.clone();
            data.insert(
                FIELD_SERVER_VERSION.to_string(),
                Value::from(conflict.remote_version),
            );
            Resolution {
                local_won: true,
                winning_data: data,
                server_version: conflict.remote_version,
            }
        } else {
            Resolution {
                local_won: false,
                winning_data: conflict.remote_data.clone(),
                server_version: conflict.remote_version,
            }
        }
    }

    fn name(&self) -> &'static str {
        "last_write_wins"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn create_conflict(local_offset_secs: i64) -> Conflict {
        let t = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap();
        Conflict {
            entity_id: "je-1".to_string(),
            entity_type: EntityType::JournalEntry,
            local_data: json!({"content": "local"}).as_object().cloned().unwrap(),
            local_updated_at: t + Duration::seconds(local_offset_secs),
            local_version: Some(3),
            remote_data: json!({"content": "remote"}).as_object().cloned().unwrap(),
            remote_updated_at: t,
            remote_version: 4,
        }
    }

    #[test]
    fn test_newer_local_wins_with_server_version_attached() {
        let resolution = LastWriteWinsResolver.resolve(&create_conflict(1));
        assert!(resolution.local_won);
        assert_eq!(resolution.winning_data["content"], "local");
        assert_eq!(resolution.winning_data["serverVersion"], 4);
        assert_eq!(resolution.server_version, 4);
    }

    #[test]
    fn test_newer_remote_wins() {
        let resolution = LastWriteWinsResolver.resolve(&create_conflict(-1));
        assert!(!resolution.local_won);
        assert_eq!(resolution.winning_data["content"], "remote");
    }

    #[test]
    fn test_tie_goes_to_server() {
        let resolution = LastWriteWinsResolver.resolve(&create_conflict(0));
        assert!(!resolution.local_won);
        assert_eq!(resolution.winning_data["content"], "remote");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let conflict = create_conflict(1);
        let first = LastWriteWinsResolver.resolve(&conflict);
        for _ in 0..10 {
            assert_eq!(LastWriteWinsResolver.resolve(&conflict), first);
        }
    }

    #[test]
    fn test_from_records() {
        let t = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap();
        let local = EntityRecord::pending(
            EntityType::Bet,
            "bet-9",
            json!({"statement": "mine"}).as_object().cloned().unwrap(),
            t,
        );
        let remote = EntityRecord::from_wire(
            EntityType::Bet,
            &json!({"id": "bet-9", "statement": "theirs", "serverVersion": 11}),
        )
        .unwrap();

        let conflict = Conflict::from_records(&local, &remote);
        assert_eq!(conflict.entity_id, "bet-9");
        assert_eq!(conflict.local_version, None);
        assert_eq!(conflict.remote_version, 11);
        assert_eq!(conflict.remote_data["statement"], "theirs");
        assert_eq!(LastWriteWinsResolver.name(), "last_write_wins");
    }
}
