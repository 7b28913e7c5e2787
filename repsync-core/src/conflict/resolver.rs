//! Applying the user's conflict choices
//!
//! Local and merge choices are written straight to the remote as a
//! single-item batch based on the remote version the conflict was
//! detected against. Remote choices just drop the pending local write.
//! Either way the queue items the record covers are removed and the entity
//! is unblocked. Edits queued for the entity after the conflict was found
//! stay queued, rebased onto the version the resolution left on the remote.

use crate::conflict::detector::ConflictDetector;
use crate::conflict::errors::{ConflictError, ConflictResult};
use crate::conflict::record::{ConflictRecord, ConflictResolution};
use crate::flush::status::{SyncPhase, SyncStatusTracker};
use crate::invalidation::InvalidationCoordinator;
use crate::metrics;
use crate::queue::item::{EntityRef, ItemType, QueueItem, WriteIntent};
use crate::queue::store::QueueStore;
use crate::remote::RemoteService;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of applying a set of choices
#[derive(Debug, Default)]
pub struct ResolutionReport {
    /// Records settled with the given resolution
    pub resolved: Vec<(String, ConflictResolution)>,
    /// Records whose write was rejected or whose queue items could not be
    /// updated; they stay pending
    pub failed: Vec<(String, ConflictError)>,
}

impl ResolutionReport {
    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    fn ids_with(&self, resolution: ConflictResolution) -> Vec<String> {
        self.resolved
            .iter()
            .filter(|(_, r)| *r == resolution)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn applied_local(&self) -> Vec<String> {
        self.ids_with(ConflictResolution::Local)
    }

    pub fn applied_merge(&self) -> Vec<String> {
        self.ids_with(ConflictResolution::Merge)
    }

    /// Records settled by keeping the remote copy
    pub fn discarded(&self) -> Vec<String> {
        self.ids_with(ConflictResolution::Remote)
    }
}

pub struct ConflictResolver {
    detector: Arc<ConflictDetector>,
    store: Arc<QueueStore>,
    remote: RemoteService,
    status: Arc<SyncStatusTracker>,
    invalidation: Arc<InvalidationCoordinator>,
    debounce: Duration,
}

impl ConflictResolver {
    pub fn new(
        detector: Arc<ConflictDetector>,
        store: Arc<QueueStore>,
        remote: RemoteService,
        status: Arc<SyncStatusTracker>,
        invalidation: Arc<InvalidationCoordinator>,
    ) -> Self {
        Self {
            detector,
            store,
            remote,
            status,
            invalidation,
            debounce: Duration::from_millis(500),
        }
    }

    /// How long Done lingers before the phase settles
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Remote version after a resolved write landed
    ///
    /// Falls back to the conflict's remote version when the read-back
    /// fails; later edits then surface as a fresh conflict.
    async fn written_version(&self, record: &ConflictRecord) -> DateTime<Utc> {
        match self.remote.fetch_entity(&record.entity).await {
            Ok(current) => current.updated_at,
            Err(e) => {
                warn!(entity = %record.entity, error = %e, "could not read back resolved version");
                record.remote_timestamp
            }
        }
    }

    fn plan(
        &self,
        choices: &HashMap<String, ConflictResolution>,
    ) -> ConflictResult<Vec<(ConflictRecord, ConflictResolution)>> {
        let pending = self.detector.pending();

        if let Some(unknown) = choices.keys().find(|id| !pending.iter().any(|r| &r.id == *id)) {
            return Err(ConflictError::UnknownConflict(unknown.clone()));
        }

        let mut plan = Vec::with_capacity(pending.len());
        for record in pending {
            let resolution = choices.get(&record.id).copied().unwrap_or_default();
            if !record.allows(resolution) {
                return Err(ConflictError::MergeUnsupported { kind: record.kind() });
            }
            plan.push((record, resolution));
        }
        Ok(plan)
    }

    /// Settle every pending conflict
    ///
    /// `choices` maps conflict ids to resolutions; conflicts left out keep
    /// the remote version. All choices are validated before anything is
    /// written. A record whose write is rejected, or whose queue items
    /// cannot be updated, stays pending and is listed in the report. The
    /// phase always leaves Saving.
    pub async fn finalize(
        &self,
        choices: &HashMap<String, ConflictResolution>,
    ) -> ConflictResult<ResolutionReport> {
        let plan = self.plan(choices)?;
        let mut report = ResolutionReport::default();
        if plan.is_empty() {
            return Ok(report);
        }

        // Build every payload up front so a bad merge writes nothing
        let mut writes = Vec::with_capacity(plan.len());
        for (record, resolution) in plan {
            let data = record.resolved_data(resolution)?;
            writes.push((record, resolution, data));
        }

        self.status.set_phase(SyncPhase::Saving);
        let mut settled: Vec<EntityRef> = Vec::new();

        for (record, resolution, data) in writes {
            let mut version = record.remote_timestamp;
            if let Some(data) = data {
                let intent = WriteIntent::new(record.entity.clone(), data)
                    .based_on(record.remote_timestamp);
                let item = QueueItem::new(ItemType::save_for(record.kind()), intent);

                if let Err(e) = self.remote.submit_batch(std::slice::from_ref(&item)).await {
                    warn!(conflict_id = %record.id, entity = %record.entity, error = %e, "resolved write rejected");
                    report.failed.push((record.id.clone(), e.into()));
                    continue;
                }
                version = self.written_version(&record).await;
                settled.push(record.entity.clone());
            }

            let entity = record.entity.clone();
            let covered: HashSet<&str> = record.queue_item_ids.iter().map(String::as_str).collect();
            let updated = self.store.modify(|items| {
                items.retain(|item| !covered.contains(item.id.as_str()));
                let mut rebased = 0;
                for item in items.iter_mut().filter(|item| item.entity() == &entity) {
                    item.payload.base_updated_at = Some(version);
                    rebased += 1;
                }
                rebased
            });

            match updated {
                Ok(0) => {}
                Ok(rebased) => {
                    debug!(entity = %entity, rebased, version = %version, "later edits rebased onto resolved version");
                }
                Err(e) => {
                    warn!(conflict_id = %record.id, entity = %entity, error = %e, "queue not updated after resolution");
                    // A retry must build on what is now on the remote
                    self.detector.rebase(&record.id, version);
                    report.failed.push((record.id.clone(), e.into()));
                    continue;
                }
            }
            self.detector.take(&record.id);

            info!(conflict_id = %record.id, entity = %record.entity, resolution = %resolution, "conflict resolved");
            metrics::record_counter(metrics::CONFLICTS_RESOLVED, 1);
            report.resolved.push((record.id, resolution));
            if !settled.contains(&entity) {
                settled.push(entity);
            }
        }

        if !settled.is_empty() {
            self.invalidation.invalidate_entities(&settled).await;
        }
        self.status.set_pending(self.store.len());

        let phase = if report.failed.is_empty() {
            SyncPhase::Done
        } else {
            let message = report
                .failed
                .first()
                .map(|(_, e)| e.to_string())
                .unwrap_or_default();
            self.status.set_last_error(Some(message));
            SyncPhase::Error
        };
        self.status.finish(phase, self.debounce);

        Ok(report)
    }
}
