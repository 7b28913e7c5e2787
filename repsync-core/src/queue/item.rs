/*
    item.rs - Queue item and write intent model

    A QueueItem is one durable, ordered write intent awaiting delivery.
    The serialized layout is the on-disk format and must round-trip
    exactly across restarts:

        { "id", "type", "payload", "attempts", "enqueuedAt", "lastError"? }
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of domain entity a write intent targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Workout,
    Template,
    Exercise,
    BodyMetric,
    Settings,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Workout => "workout",
            EntityKind::Template => "template",
            EntityKind::Exercise => "exercise",
            EntityKind::BodyMetric => "body_metric",
            EntityKind::Settings => "settings",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "workout" => Some(EntityKind::Workout),
            "template" => Some(EntityKind::Template),
            "exercise" => Some(EntityKind::Exercise),
            "body_metric" => Some(EntityKind::BodyMetric),
            "settings" => Some(EntityKind::Settings),
            _ => None,
        }
    }

    /// Field holding the ordered sub-item list, for kinds that have one
    pub fn sub_item_field(&self) -> Option<&'static str> {
        match self {
            EntityKind::Workout | EntityKind::Template => Some("exercises"),
            _ => None,
        }
    }

    /// Whether two versions of this kind can be combined field by field
    pub fn supports_merge(&self) -> bool {
        self.sub_item_field().is_some()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to a single remote entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        EntityRef { kind, id: id.into() }
    }

    pub fn workout(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Workout, id)
    }

    pub fn template(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Template, id)
    }

    /// Parse the `kind:id` form used on the command line
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, id) = s.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        Some(EntityRef::new(EntityKind::from_str(kind)?, id))
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Type tag of a queue item
///
/// Known write kinds get their own variant; anything else is carried
/// verbatim in `Custom` so newer clients can enqueue types this build
/// does not know about. Always persisted as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemType {
    WorkoutSave,
    WorkoutDelete,
    TemplateSave,
    TemplateDelete,
    ExerciseSave,
    BodyMetricSave,
    SettingsSave,
    Custom(String),
}

impl ItemType {
    pub fn as_str(&self) -> &str {
        match self {
            ItemType::WorkoutSave => "workout_save",
            ItemType::WorkoutDelete => "workout_delete",
            ItemType::TemplateSave => "template_save",
            ItemType::TemplateDelete => "template_delete",
            ItemType::ExerciseSave => "exercise_save",
            ItemType::BodyMetricSave => "body_metric_save",
            ItemType::SettingsSave => "settings_save",
            ItemType::Custom(s) => s.as_str(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.as_str().ends_with("_delete")
    }

    /// Default save type for an entity kind
    pub fn save_for(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Workout => ItemType::WorkoutSave,
            EntityKind::Template => ItemType::TemplateSave,
            EntityKind::Exercise => ItemType::ExerciseSave,
            EntityKind::BodyMetric => ItemType::BodyMetricSave,
            EntityKind::Settings => ItemType::SettingsSave,
        }
    }
}

impl From<String> for ItemType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "workout_save" => ItemType::WorkoutSave,
            "workout_delete" => ItemType::WorkoutDelete,
            "template_save" => ItemType::TemplateSave,
            "template_delete" => ItemType::TemplateDelete,
            "exercise_save" => ItemType::ExerciseSave,
            "body_metric_save" => ItemType::BodyMetricSave,
            "settings_save" => ItemType::SettingsSave,
            _ => ItemType::Custom(s),
        }
    }
}

impl From<ItemType> for String {
    fn from(t: ItemType) -> Self {
        match t {
            ItemType::Custom(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A domain write intent: "make entity X look like `data`"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteIntent {
    /// Target entity
    pub entity: EntityRef,

    /// Remote `updated_at` the local edit was based on (last known-synced version)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_updated_at: Option<DateTime<Utc>>,

    /// When the local edit was made
    pub modified_at: DateTime<Utc>,

    /// Full entity body as the client wants it stored
    pub data: serde_json::Value,
}

impl WriteIntent {
    pub fn new(entity: EntityRef, data: serde_json::Value) -> Self {
        WriteIntent {
            entity,
            base_updated_at: None,
            modified_at: Utc::now(),
            data,
        }
    }

    pub fn based_on(mut self, base_updated_at: DateTime<Utc>) -> Self {
        self.base_updated_at = Some(base_updated_at);
        self
    }
}

/// A durable queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,

    #[serde(rename = "type")]
    pub item_type: ItemType,

    pub payload: WriteIntent,

    pub attempts: u32,

    pub enqueued_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Fresh item with a generated id and zero attempts
    pub fn new(item_type: ItemType, payload: WriteIntent) -> Self {
        QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            item_type,
            payload,
            attempts: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.payload.entity
    }

    /// Record one failed delivery attempt
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}
