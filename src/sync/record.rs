//! Sync-relevant projection of a domain entity and its wire codec
//!
//! Entity payloads stay schema-less: everything except the sync columns is
//! carried as a JSON object. The server speaks camelCase with the sync columns
//! flattened next to the data fields.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::types::{EntitySyncStatus, EntityType};
use crate::error::{SyncError, SyncResult};

pub const FIELD_ID: &str = "id";
pub const FIELD_UPDATED_AT: &str = "updatedAt";
pub const FIELD_SERVER_VERSION: &str = "serverVersion";

/// Local record as the entity store exposes it to the sync engine
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub entity_type: EntityType,
    pub id: String,
    /// Remaining entity fields
    pub data: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
    pub server_version: Option<u64>,
    pub sync_status: EntitySyncStatus,
    pub deleted: bool,
}

impl EntityRecord {
    /// A freshly edited local record awaiting push
    pub fn pending(
        entity_type: EntityType,
        id: impl Into<String>,
        data: Map<String, Value>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type,
            id: id.into(),
            data,
            updated_at,
            server_version: None,
            sync_status: EntitySyncStatus::Pending,
            deleted: false,
        }
    }

    /// Decode a server record. The sync columns are lifted out of the object.
    pub fn from_wire(entity_type: EntityType, value: &Value) -> SyncResult<Self> {
        let obj = value.as_object().ok_or_else(|| {
            SyncError::InvalidRecord(format!("{} record is not a JSON object", entity_type))
        })?;

        let id = obj
            .get(FIELD_ID)
            .and_then(id_as_string)
            .ok_or_else(|| SyncError::InvalidRecord(format!("{} record has no id", entity_type)))?;

        let updated_at = extract_timestamp(value).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let server_version = obj.get(FIELD_SERVER_VERSION).and_then(Value::as_u64);

        let data = obj
            .iter()
            .filter(|(k, _)| !is_sync_column(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            entity_type,
            id,
            data,
            updated_at,
            server_version,
            sync_status: EntitySyncStatus::Synced,
            deleted: false,
        })
    }

    /// Encode for transmission
    pub fn to_wire(&self) -> Value {
        let mut obj = self.data.clone();
        obj.insert(FIELD_ID.to_string(), Value::String(self.id.clone()));
        obj.insert(
            FIELD_UPDATED_AT.to_string(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        if let Some(version) = self.server_version {
            obj.insert(FIELD_SERVER_VERSION.to_string(), Value::from(version));
        }
        Value::Object(obj)
    }
}

fn is_sync_column(key: &str) -> bool {
    matches!(key, FIELD_ID | FIELD_UPDATED_AT | FIELD_SERVER_VERSION)
}

fn id_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract the entity's own modification time from a JSON record
pub fn extract_timestamp(data: &Value) -> Option<DateTime<Utc>> {
    data.get(FIELD_UPDATED_AT)
        .or_else(|| data.get("updated_at"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
