/*
    record.rs - Conflict records, resolutions and field-level merge

    A conflict pairs the pending local version of an entity with the
    remote version that diverged from the same base. Resolution is
    last-write-wins with a manual override: the user picks a side, or a
    merge where the entity shape allows it.

    Timestamps come from different device clocks and are shown to the
    user as a hint only. Nothing here orders writes by comparing them.
*/

use crate::conflict::errors::{ConflictError, ConflictResult};
use crate::queue::item::{EntityKind, EntityRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

/// How a conflict should be settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Write the local version over the remote one
    Local,
    /// Keep the remote version, drop the pending local write
    Remote,
    /// Combine both versions field by field
    Merge,
}

impl ConflictResolution {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(ConflictResolution::Local),
            "remote" => Some(ConflictResolution::Remote),
            "merge" => Some(ConflictResolution::Merge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Local => "local",
            ConflictResolution::Remote => "remote",
            ConflictResolution::Merge => "merge",
        }
    }
}

impl Default for ConflictResolution {
    /// Unreviewed conflicts keep the server's copy
    fn default() -> Self {
        ConflictResolution::Remote
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A detected divergence between pending local data and the remote copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub entity: EntityRef,
    pub local_data: Value,
    pub remote_data: Value,
    pub local_timestamp: DateTime<Utc>,
    pub remote_timestamp: DateTime<Utc>,
    /// Queue items carrying the local side
    pub queue_item_ids: Vec<String>,
}

impl ConflictRecord {
    pub fn kind(&self) -> EntityKind {
        self.entity.kind
    }

    /// Choices to offer for this record. Merge only for combinable kinds.
    pub fn available_resolutions(&self) -> Vec<ConflictResolution> {
        let mut choices = vec![ConflictResolution::Local, ConflictResolution::Remote];
        if self.kind().supports_merge() {
            choices.push(ConflictResolution::Merge);
        }
        choices
    }

    pub fn allows(&self, resolution: ConflictResolution) -> bool {
        self.available_resolutions().contains(&resolution)
    }

    /// Data to write for a local or merge resolution
    pub fn resolved_data(&self, resolution: ConflictResolution) -> ConflictResult<Option<Value>> {
        match resolution {
            ConflictResolution::Local => Ok(Some(self.local_data.clone())),
            ConflictResolution::Remote => Ok(None),
            ConflictResolution::Merge => {
                merge(self.kind(), &self.local_data, &self.remote_data).map(Some)
            }
        }
    }
}

fn item_key(item: &Value) -> Option<String> {
    match item.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn merge_sub_items(local: Option<&Value>, remote: Option<&Value>) -> Value {
    let empty = Vec::new();
    let local_items = local.and_then(Value::as_array).unwrap_or(&empty);
    let remote_items = remote.and_then(Value::as_array).unwrap_or(&empty);

    let mut merged = Vec::with_capacity(local_items.len().max(remote_items.len()));
    let mut seen_keys = HashSet::new();

    for remote_item in remote_items {
        match item_key(remote_item) {
            Some(key) => {
                let local_version = local_items
                    .iter()
                    .find(|l| item_key(l).as_deref() == Some(key.as_str()));
                merged.push(local_version.unwrap_or(remote_item).clone());
                seen_keys.insert(key);
            }
            None => merged.push(remote_item.clone()),
        }
    }

    for local_item in local_items {
        match item_key(local_item) {
            Some(key) if seen_keys.contains(&key) => {}
            Some(key) => {
                seen_keys.insert(key);
                merged.push(local_item.clone());
            }
            None if !merged.contains(local_item) => merged.push(local_item.clone()),
            None => {}
        }
    }

    Value::Array(merged)
}

/// Combine two versions of a mergeable entity
///
/// The remote object is the base. Local top-level fields replace remote
/// ones, except the sub-item list, which is unioned by item `id`: remote
/// order first with local versions of shared items, then local-only items.
pub fn merge(kind: EntityKind, local: &Value, remote: &Value) -> ConflictResult<Value> {
    let field = kind
        .sub_item_field()
        .ok_or(ConflictError::MergeUnsupported { kind })?;

    let (Some(local_obj), Some(remote_obj)) = (local.as_object(), remote.as_object()) else {
        return Err(ConflictError::NotMergeable(format!(
            "{} data must be JSON objects on both sides",
            kind
        )));
    };

    let mut merged: Map<String, Value> = remote_obj.clone();
    for (key, value) in local_obj {
        if key != field {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.insert(
        field.to_string(),
        merge_sub_items(local_obj.get(field), remote_obj.get(field)),
    );

    Ok(Value::Object(merged))
}
