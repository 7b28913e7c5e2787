//! Conflict detection and the set of entities waiting on user input
//!
//! When a batch is rejected for version divergence the detector fetches
//! the remote copy of each named entity and compares it with the base the
//! local edit was made against. Entities with a pending record are
//! blocked: their queue items stay put but are not batched until the
//! record is resolved.

use crate::conflict::record::ConflictRecord;
use crate::queue::item::{EntityRef, QueueItem};
use crate::remote::{RemoteApi, RemoteEntity, RemoteError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What came of inspecting a rejected batch
#[derive(Debug, Default)]
pub struct Detection {
    /// Ids of newly recorded conflicts
    pub recorded: Vec<String>,
    /// Entities named by the remote whose copy did not actually move
    pub spurious: Vec<EntityRef>,
    /// Remote snapshot could not be fetched; nothing was recorded
    pub fetch_error: Option<RemoteError>,
}

impl Detection {
    pub fn found_anything(&self) -> bool {
        !self.recorded.is_empty() || !self.spurious.is_empty()
    }
}

pub struct ConflictDetector {
    pending: RwLock<Vec<ConflictRecord>>,
    count_tx: watch::Sender<usize>,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictDetector {
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            pending: RwLock::new(Vec::new()),
            count_tx,
        }
    }

    /// Pending records, oldest first
    pub fn pending(&self) -> Vec<ConflictRecord> {
        self.pending.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    pub fn get(&self, id: &str) -> Option<ConflictRecord> {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Number of pending conflicts, updated on every change
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    pub fn is_blocked(&self, entity: &EntityRef) -> bool {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| &r.entity == entity)
    }

    pub fn blocked_entities(&self) -> HashSet<EntityRef> {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.entity.clone())
            .collect()
    }

    /// Add a record. Refused when the entity already has one pending.
    pub fn record(&self, record: ConflictRecord) -> bool {
        let mut pending = self.pending.write().unwrap_or_else(PoisonError::into_inner);
        if pending.iter().any(|r| r.entity == record.entity) {
            return false;
        }
        info!(conflict_id = %record.id, entity = %record.entity, "conflict recorded");
        pending.push(record);
        self.count_tx.send_replace(pending.len());
        true
    }

    /// Move a pending record onto a newer remote version
    pub fn rebase(&self, id: &str, remote_timestamp: DateTime<Utc>) -> bool {
        let mut pending = self.pending.write().unwrap_or_else(PoisonError::into_inner);
        match pending.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.remote_timestamp = remote_timestamp;
                true
            }
            None => false,
        }
    }

    /// Drop a resolved record
    pub fn take(&self, id: &str) -> Option<ConflictRecord> {
        let mut pending = self.pending.write().unwrap_or_else(PoisonError::into_inner);
        let index = pending.iter().position(|r| r.id == id)?;
        let record = pending.remove(index);
        self.count_tx.send_replace(pending.len());
        Some(record)
    }

    /// Build a record from the local items of one entity and its remote copy
    ///
    /// `items` must be in queue order. Returns `None` when the remote copy
    /// has not moved past the base the local edits were made against.
    pub fn build_record(items: &[&QueueItem], remote: RemoteEntity) -> Option<ConflictRecord> {
        let latest = items.last()?;
        let base = items.iter().find_map(|i| i.payload.base_updated_at);

        if let Some(base) = base {
            if remote.updated_at <= base {
                return None;
            }
        }

        Some(ConflictRecord {
            id: uuid::Uuid::new_v4().to_string(),
            entity: remote.entity,
            local_data: latest.payload.data.clone(),
            remote_data: remote.data,
            local_timestamp: latest.payload.modified_at,
            remote_timestamp: remote.updated_at,
            queue_item_ids: items.iter().map(|i| i.id.clone()).collect(),
        })
    }

    /// Inspect a batch the remote rejected for divergence on `entities`
    ///
    /// Every snapshot is fetched before anything is recorded, so a fetch
    /// failure leaves no partial state behind.
    pub async fn detect(
        &self,
        remote: &dyn RemoteApi,
        batch: &[QueueItem],
        entities: &[EntityRef],
    ) -> Detection {
        let mut detection = Detection::default();
        let mut snapshots = Vec::new();

        let mut seen = HashSet::new();
        for entity in entities {
            if !seen.insert(entity) || !batch.iter().any(|i| i.entity() == entity) {
                continue;
            }
            match remote.fetch_entity(entity).await {
                Ok(snapshot) => snapshots.push((entity.clone(), snapshot)),
                // Deleted remotely since the base; the remote side is "gone"
                Err(RemoteError::NotFound(_)) => snapshots.push((
                    entity.clone(),
                    RemoteEntity {
                        entity: entity.clone(),
                        updated_at: Utc::now(),
                        data: Value::Null,
                    },
                )),
                Err(e) => {
                    warn!(entity = %entity, error = %e, "could not fetch remote copy for conflict");
                    detection.fetch_error = Some(e);
                    return detection;
                }
            }
        }

        for (entity, snapshot) in snapshots {
            let items: Vec<&QueueItem> = batch.iter().filter(|i| i.entity() == &entity).collect();
            match Self::build_record(&items, snapshot) {
                Some(record) => {
                    let id = record.id.clone();
                    if self.record(record) {
                        detection.recorded.push(id);
                    }
                }
                None => {
                    debug!(entity = %entity, "remote copy unchanged since base, treating as transient");
                    detection.spurious.push(entity);
                }
            }
        }

        detection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::item::{ItemType, WriteIntent};
    use crate::remote::MockRemote;
    use chrono::Duration;
    use serde_json::json;

    fn save(entity: EntityRef, data: serde_json::Value, base: chrono::DateTime<Utc>) -> QueueItem {
        let kind = entity.kind;
        QueueItem::new(ItemType::save_for(kind), WriteIntent::new(entity, data).based_on(base))
    }

    #[test]
    fn test_build_record_uses_latest_local_item() {
        let base = Utc::now();
        let first = save(EntityRef::workout("1"), json!({"v": 1}), base);
        let second = save(EntityRef::workout("1"), json!({"v": 2}), base);
        let remote = RemoteEntity {
            entity: EntityRef::workout("1"),
            updated_at: base + Duration::seconds(5),
            data: json!({"v": "remote"}),
        };

        let record = ConflictDetector::build_record(&[&first, &second], remote).unwrap();
        assert_eq!(record.local_data, json!({"v": 2}));
        assert_eq!(record.queue_item_ids, vec![first.id.clone(), second.id.clone()]);
    }

    #[test]
    fn test_unmoved_remote_is_not_a_conflict() {
        let base = Utc::now();
        let item = save(EntityRef::workout("1"), json!({}), base);
        let remote = RemoteEntity {
            entity: EntityRef::workout("1"),
            updated_at: base,
            data: json!({}),
        };
        assert!(ConflictDetector::build_record(&[&item], remote).is_none());
    }

    #[test]
    fn test_one_pending_record_per_entity() {
        let detector = ConflictDetector::new();
        let base = Utc::now();
        let item = save(EntityRef::workout("1"), json!({}), base);
        let remote = RemoteEntity {
            entity: EntityRef::workout("1"),
            updated_at: base + Duration::seconds(1),
            data: json!({}),
        };
        let record = ConflictDetector::build_record(&[&item], remote).unwrap();

        assert!(detector.record(record.clone()));
        assert!(!detector.record(ConflictRecord { id: "other".into(), ..record.clone() }));
        assert!(detector.is_blocked(&EntityRef::workout("1")));

        detector.take(&record.id);
        assert!(!detector.has_pending());
        assert_eq!(*detector.subscribe().borrow(), 0);
    }

    #[tokio::test]
    async fn test_detect_fetches_and_records() {
        let remote = MockRemote::new();
        let base = remote.seed(EntityRef::workout("1"), json!({"name": "a"}));
        remote.external_edit(EntityRef::workout("1"), json!({"name": "b"}));

        let batch = vec![save(EntityRef::workout("1"), json!({"name": "c"}), base)];
        let detector = ConflictDetector::new();
        let detection = detector.detect(&remote, &batch, &[EntityRef::workout("1")]).await;

        assert_eq!(detection.recorded.len(), 1);
        let record = detector.get(&detection.recorded[0]).unwrap();
        assert_eq!(record.remote_data, json!({"name": "b"}));
        assert_eq!(record.local_data, json!({"name": "c"}));
    }

    #[tokio::test]
    async fn test_fetch_failure_records_nothing() {
        let remote = MockRemote::new();
        let base = remote.seed(EntityRef::workout("1"), json!({}));
        remote.external_edit(EntityRef::workout("1"), json!({"x": 1}));
        remote.fail_fetches(true);

        let batch = vec![save(EntityRef::workout("1"), json!({}), base)];
        let detector = ConflictDetector::new();
        let detection = detector.detect(&remote, &batch, &[EntityRef::workout("1")]).await;

        assert!(detection.fetch_error.is_some());
        assert!(!detector.has_pending());
    }
}
