/*
    engine.rs - Flush engine

    One pass drains the queue to the remote:
    1. prune items that already used up their attempts
    2. snapshot the queue, skip conflict-blocked entities, cut into batches
    3. submit batches one after another; stop at the first failure
    4. invalidate read views for every delivered entity, once

    Only one pass runs at a time. A second call while a pass is active
    returns `FlushOutcome::Skipped` without touching anything.

    The engine never sleeps between batches and never schedules retries.
    Cadence belongs to the trigger controller.
*/

use crate::conflict::detector::ConflictDetector;
use crate::flush::errors::{FlushError, FlushResult};
use crate::flush::status::{SyncPhase, SyncStatusTracker};
use crate::invalidation::InvalidationCoordinator;
use crate::metrics;
use crate::queue::item::{EntityRef, QueueItem};
use crate::queue::store::QueueStore;
use crate::remote::{RemoteError, RemoteService};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Unacknowledged exhaustion notices kept for `take_exhausted`; the oldest
/// are dropped beyond this
pub const EXHAUSTED_LOG_CAPACITY: usize = 256;

/// Engine tunables
#[derive(Debug, Clone, PartialEq)]
pub struct FlushConfig {
    /// Items per remote call
    pub batch_size: usize,
    /// Failed deliveries before an item is dropped as exhausted
    pub max_attempts: u32,
    /// How long Done/Error stay visible before settling
    pub debounce: Duration,
    /// Periodic trigger interval, also used to estimate the next retry
    pub flush_interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_attempts: 8,
            debounce: Duration::from_millis(500),
            flush_interval: Duration::from_secs(60),
        }
    }
}

impl FlushConfig {
    pub fn validate(&self) -> FlushResult<()> {
        if self.batch_size == 0 {
            return Err(FlushError::InvalidConfig("batch_size must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(FlushError::InvalidConfig("max_attempts must be at least 1".to_string()));
        }
        if self.flush_interval.is_zero() {
            return Err(FlushError::InvalidConfig("flush_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// An item removed for good after exhausting its attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ExhaustedItem {
    pub item: QueueItem,
    pub error: String,
    pub removed_at: DateTime<Utc>,
}

/// What one pass did
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    /// Ids accepted by the remote
    pub delivered: Vec<String>,
    pub batches_delivered: usize,
    /// Ids put back at the front of the queue after a failure
    pub requeued: Vec<String>,
    pub exhausted: Vec<ExhaustedItem>,
    /// Ids of conflict records raised in this pass
    pub conflicts: Vec<String>,
    /// Items left alone because their entity has a pending conflict
    pub blocked: usize,
    /// Some batches were never attempted
    pub stopped_early: bool,
}

impl FlushReport {
    pub fn is_noop(&self) -> bool {
        self.delivered.is_empty()
            && self.requeued.is_empty()
            && self.exhausted.is_empty()
            && self.conflicts.is_empty()
    }
}

#[derive(Debug)]
pub enum FlushOutcome {
    /// Another pass was already running
    Skipped,
    Completed(FlushReport),
    /// The pass could not start; the queue is untouched
    Faulted(FlushError),
}

impl FlushOutcome {
    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            FlushOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, FlushOutcome::Skipped)
    }
}

/// Clears the single-flight flag when the pass ends, however it ends
struct ActiveGuard<'a>(&'a AtomicBool);

impl<'a> ActiveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ActiveGuard(flag))
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct FlushEngine {
    store: Arc<QueueStore>,
    remote: RemoteService,
    status: Arc<SyncStatusTracker>,
    detector: Arc<ConflictDetector>,
    invalidation: Arc<InvalidationCoordinator>,
    config: FlushConfig,
    active: AtomicBool,
    exhausted_tx: broadcast::Sender<ExhaustedItem>,
    exhausted_log: Mutex<VecDeque<ExhaustedItem>>,
}

impl FlushEngine {
    pub fn new(
        store: Arc<QueueStore>,
        remote: RemoteService,
        status: Arc<SyncStatusTracker>,
        detector: Arc<ConflictDetector>,
        invalidation: Arc<InvalidationCoordinator>,
        config: FlushConfig,
    ) -> FlushResult<Self> {
        config.validate()?;
        let (exhausted_tx, _) = broadcast::channel(64);
        Ok(Self {
            store,
            remote,
            status,
            detector,
            invalidation,
            config,
            active: AtomicBool::new(false),
            exhausted_tx,
            exhausted_log: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    pub fn status(&self) -> &Arc<SyncStatusTracker> {
        &self.status
    }

    /// A pass is in progress
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Live notices of items dropped after exhausting their attempts
    pub fn subscribe_exhausted(&self) -> broadcast::Receiver<ExhaustedItem> {
        self.exhausted_tx.subscribe()
    }

    /// Drain exhausted items not yet acknowledged, oldest first
    ///
    /// At most `EXHAUSTED_LOG_CAPACITY` are held between drains.
    pub fn take_exhausted(&self) -> Vec<ExhaustedItem> {
        let mut log = self.exhausted_log.lock().unwrap_or_else(PoisonError::into_inner);
        Vec::from(std::mem::take(&mut *log))
    }

    /// Run one pass
    pub async fn flush(&self) -> FlushOutcome {
        let Some(_guard) = ActiveGuard::acquire(&self.active) else {
            debug!("flush already in progress, skipping");
            return FlushOutcome::Skipped;
        };

        let timer = metrics::Timer::new(metrics::FLUSH_DURATION_MS);
        self.status.set_phase(SyncPhase::Flushing);

        let outcome = match self.run_pass().await {
            Ok(report) => {
                info!(
                    delivered = report.delivered.len(),
                    requeued = report.requeued.len(),
                    exhausted = report.exhausted.len(),
                    conflicts = report.conflicts.len(),
                    stopped_early = report.stopped_early,
                    "flush pass completed"
                );
                self.status.finish(SyncPhase::Done, self.config.debounce);
                FlushOutcome::Completed(report)
            }
            Err(e) => {
                error!(error = %e, "flush pass faulted");
                self.status.set_last_error(Some(e.to_string()));
                self.status.finish(SyncPhase::Error, self.config.debounce);
                FlushOutcome::Faulted(e)
            }
        };

        timer.stop();
        outcome
    }

    /// Errors returned from here happened before any batch was sent
    async fn run_pass(&self) -> FlushResult<FlushReport> {
        let mut report = FlushReport::default();
        let max_attempts = self.config.max_attempts;

        let pruned = self.store.modify(|items| {
            let (exhausted, keep): (Vec<_>, Vec<_>) =
                items.drain(..).partition(|item| item.is_exhausted(max_attempts));
            *items = keep;
            exhausted
        })?;
        for item in pruned {
            let error = item
                .last_error
                .clone()
                .unwrap_or_else(|| "maximum delivery attempts reached".to_string());
            self.report_exhausted(item, error, &mut report);
        }

        let blocked = self.detector.blocked_entities();
        let snapshot = self.store.read()?;
        let total = snapshot.len();
        let eligible: Vec<QueueItem> = snapshot
            .into_iter()
            .filter(|item| !blocked.contains(item.entity()))
            .collect();
        report.blocked = total - eligible.len();

        if eligible.is_empty() {
            debug!(blocked = report.blocked, "nothing to flush");
            self.status.set_pending(total);
            return Ok(report);
        }

        let batches: Vec<&[QueueItem]> = eligible.chunks(self.config.batch_size).collect();
        let batch_count = batches.len();
        let mut touched: BTreeSet<EntityRef> = BTreeSet::new();
        let mut failure: Option<String> = None;

        debug!(items = eligible.len(), batches = batch_count, "flushing queue");

        for (index, batch) in batches.into_iter().enumerate() {
            let keep_going = match self.remote.submit_batch(batch).await {
                Ok(()) => self.on_delivered(index, batch, &mut touched, &mut report),
                Err(e @ RemoteError::VersionConflict { .. }) => {
                    failure = self.on_conflict(batch, &e, &mut report).await;
                    false
                }
                Err(e) => {
                    warn!(batch = index, items = batch.len(), error = %e, "batch delivery failed");
                    metrics::record_counter(metrics::BATCHES_FAILED, 1);
                    self.on_failed(batch, &e.to_string(), &mut report);
                    failure = Some(e.to_string());
                    false
                }
            };

            if !keep_going {
                report.stopped_early = index + 1 < batch_count;
                break;
            }
        }

        if !touched.is_empty() {
            let entities: Vec<EntityRef> = touched.into_iter().collect();
            self.invalidation.invalidate_entities(&entities).await;
        }

        if let Some(error) = failure {
            let next_retry = chrono::Duration::from_std(self.config.flush_interval)
                .ok()
                .map(|interval| Utc::now() + interval);
            self.status.record_failure(&error, next_retry);
        }

        let depth = self.store.len();
        if report.delivered.is_empty() {
            self.status.set_pending(depth);
        } else {
            self.status.record_delivery(Utc::now(), depth);
        }

        Ok(report)
    }

    /// Returns whether the pass should continue
    fn on_delivered(
        &self,
        index: usize,
        batch: &[QueueItem],
        touched: &mut BTreeSet<EntityRef>,
        report: &mut FlushReport,
    ) -> bool {
        let ids: HashSet<String> = batch.iter().map(|item| item.id.clone()).collect();

        // Delivered even if the removal fails; the items would be sent again
        report.delivered.extend(batch.iter().map(|item| item.id.clone()));
        report.batches_delivered += 1;
        touched.extend(batch.iter().map(|item| item.entity().clone()));
        metrics::record_counter(metrics::BATCHES_DELIVERED, 1);

        match self.store.remove_ids(&ids) {
            Ok(removed) => {
                info!(batch = index, items = removed, "batch delivered");
                true
            }
            Err(e) => {
                error!(batch = index, error = %e, "batch delivered but could not be removed from the queue");
                false
            }
        }
    }

    /// Count a failed attempt for each item in `failed`
    ///
    /// Survivors go back to the front of the queue in their original order.
    fn on_failed(&self, failed: &[QueueItem], error: &str, report: &mut FlushReport) {
        let max_attempts = self.config.max_attempts;
        let result = self.store.modify(|items| {
            let mut requeue = Vec::with_capacity(failed.len());
            let mut exhausted = Vec::new();

            for stale in failed {
                let Some(pos) = items.iter().position(|item| item.id == stale.id) else {
                    continue;
                };
                let mut item = items.remove(pos);
                item.record_failure(error);
                if item.is_exhausted(max_attempts) {
                    exhausted.push(item);
                } else {
                    requeue.push(item);
                }
            }

            let requeued: Vec<String> = requeue.iter().map(|item| item.id.clone()).collect();
            items.splice(0..0, requeue);
            (requeued, exhausted)
        });

        match result {
            Ok((requeued, exhausted)) => {
                report.requeued.extend(requeued);
                for item in exhausted {
                    self.report_exhausted(item, error.to_string(), report);
                }
            }
            Err(e) => {
                error!(error = %e, "could not record failed attempts, queue left unchanged");
            }
        }
    }

    /// Route a version rejection to conflict detection
    ///
    /// Returns the error to surface as the pass's failure, if any.
    async fn on_conflict(
        &self,
        batch: &[QueueItem],
        rejection: &RemoteError,
        report: &mut FlushReport,
    ) -> Option<String> {
        let RemoteError::VersionConflict { entities } = rejection else {
            return None;
        };
        warn!(entities = entities.len(), "batch rejected for version conflict");

        let detection = self.detector.detect(self.remote.as_ref(), batch, entities).await;

        if let Some(e) = detection.fetch_error {
            // Nothing recorded, nothing counted; the next pass tries again
            return Some(e.to_string());
        }

        if !detection.found_anything() {
            metrics::record_counter(metrics::BATCHES_FAILED, 1);
            self.on_failed(batch, &rejection.to_string(), report);
            return Some(rejection.to_string());
        }

        if !detection.recorded.is_empty() {
            metrics::record_counter(metrics::CONFLICTS_DETECTED, detection.recorded.len() as u64);
            report.conflicts.extend(detection.recorded);
        }

        if detection.spurious.is_empty() {
            return None;
        }

        let spurious: Vec<QueueItem> = batch
            .iter()
            .filter(|item| detection.spurious.contains(item.entity()))
            .cloned()
            .collect();
        self.on_failed(&spurious, &rejection.to_string(), report);
        Some(rejection.to_string())
    }

    fn report_exhausted(&self, item: QueueItem, error: String, report: &mut FlushReport) {
        error!(
            item_id = %item.id,
            entity = %item.entity(),
            attempts = item.attempts,
            error = %error,
            "queue item exhausted its delivery attempts"
        );
        metrics::record_counter(metrics::ITEMS_EXHAUSTED, 1);
        self.status.record_exhausted(1, &error);

        let exhausted = ExhaustedItem {
            item,
            error,
            removed_at: Utc::now(),
        };
        {
            let mut log = self.exhausted_log.lock().unwrap_or_else(PoisonError::into_inner);
            if log.len() == EXHAUSTED_LOG_CAPACITY {
                if let Some(dropped) = log.pop_front() {
                    debug!(item_id = %dropped.item.id, "exhaustion log full, dropping oldest notice");
                }
            }
            log.push_back(exhausted.clone());
        }
        // No subscribers is fine; the log still has it
        let _ = self.exhausted_tx.send(exhausted.clone());
        report.exhausted.push(exhausted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::RecordingCache;
    use crate::queue::item::{EntityRef, ItemType, WriteIntent};
    use crate::remote::MockRemote;
    use serde_json::json;

    struct Harness {
        store: Arc<QueueStore>,
        remote: Arc<MockRemote>,
        status: Arc<SyncStatusTracker>,
        cache: Arc<RecordingCache>,
        engine: Arc<FlushEngine>,
    }

    fn harness() -> Harness {
        let store = Arc::new(QueueStore::in_memory());
        let remote = Arc::new(MockRemote::new());
        let status = Arc::new(SyncStatusTracker::new());
        let cache = Arc::new(RecordingCache::new());
        let engine = Arc::new(FlushEngine::new(
            store.clone(),
            remote.clone(),
            status.clone(),
            Arc::new(ConflictDetector::new()),
            Arc::new(InvalidationCoordinator::new().with_cache(cache.clone())),
            FlushConfig {
                debounce: Duration::from_millis(10),
                ..FlushConfig::default()
            },
        )
        .unwrap());
        Harness { store, remote, status, cache, engine }
    }

    fn push(h: &Harness, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| {
                let item = QueueItem::new(
                    ItemType::WorkoutSave,
                    WriteIntent::new(EntityRef::workout(format!("w{}", i)), json!({"i": i})),
                );
                let id = item.id.clone();
                h.store.append(item);
                id
            })
            .collect()
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_noop() {
        let h = harness();
        let outcome = h.engine.flush().await;

        assert!(outcome.report().unwrap().is_noop());
        assert_eq!(h.remote.submission_count(), 0);
        assert_eq!(h.status.phase(), SyncPhase::Done);
        assert!(h.cache.invalidated().is_empty());
    }

    #[tokio::test]
    async fn test_batches_in_order_and_invalidates_once() {
        let h = harness();
        let ids = push(&h, 7);

        let outcome = h.engine.flush().await;
        let report = outcome.report().unwrap();

        assert_eq!(report.batches_delivered, 2);
        assert_eq!(report.delivered, ids);
        let sizes: Vec<usize> = h.remote.submissions().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![5, 2]);
        assert!(h.store.is_empty());
        assert_eq!(h.cache.invalidated_entities().len(), 7);
        let stats = h
            .cache
            .invalidated()
            .into_iter()
            .filter(|v| *v == crate::invalidation::ReadView::AggregateStats)
            .count();
        assert_eq!(stats, 1);
    }

    #[tokio::test]
    async fn test_failure_requeues_at_front_and_stops() {
        let h = harness();
        let ids = push(&h, 7);
        h.remote.fail_next(RemoteError::Timeout);

        let outcome = h.engine.flush().await;
        let report = outcome.report().unwrap();

        assert!(report.stopped_early);
        assert_eq!(h.remote.submission_count(), 1);
        assert_eq!(report.requeued, ids[..5].to_vec());

        let queued = h.store.read().unwrap();
        let queued_ids: Vec<String> = queued.iter().map(|i| i.id.clone()).collect();
        assert_eq!(queued_ids, ids);
        assert!(queued[..5].iter().all(|i| i.attempts == 1));
        assert_eq!(queued[0].last_error.as_deref(), Some("request timeout"));
        assert_eq!(queued[5].attempts, 0);
        assert!(h.status.snapshot().next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_items_go_before_later_appends() {
        let h = harness();
        let first = push(&h, 2);
        h.remote.fail_next(RemoteError::Network("reset".to_string()));
        h.engine.flush().await;

        let later = push(&h, 1);
        h.engine.flush().await;

        let delivered = h.remote.submissions().last().cloned().unwrap();
        let order: Vec<String> = delivered.iter().map(|i| i.id.clone()).collect();
        assert_eq!(order, vec![first[0].clone(), first[1].clone(), later[0].clone()]);
    }

    #[tokio::test]
    async fn test_prunes_items_already_at_limit() {
        let h = harness();
        let mut item = QueueItem::new(
            ItemType::WorkoutSave,
            WriteIntent::new(EntityRef::workout("x"), json!({})),
        );
        item.attempts = 8;
        item.last_error = Some("HTTP 503".to_string());
        h.store.append(item.clone());
        let mut rx = h.engine.subscribe_exhausted();

        let outcome = h.engine.flush().await;

        assert_eq!(outcome.report().unwrap().exhausted.len(), 1);
        assert_eq!(h.remote.submission_count(), 0);
        assert_eq!(rx.try_recv().unwrap().item.id, item.id);
        assert_eq!(h.engine.take_exhausted().len(), 1);
        assert!(h.engine.take_exhausted().is_empty());
        assert_eq!(h.status.snapshot().failed_operations, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_log_keeps_newest_notices() {
        let h = harness();
        let overflow = 10;
        let ids: Vec<String> = (0..EXHAUSTED_LOG_CAPACITY + overflow)
            .map(|i| {
                let mut item = QueueItem::new(
                    ItemType::WorkoutSave,
                    WriteIntent::new(EntityRef::workout(format!("w{}", i)), json!({"i": i})),
                );
                item.attempts = FlushConfig::default().max_attempts;
                let id = item.id.clone();
                h.store.append(item);
                id
            })
            .collect();

        let outcome = h.engine.flush().await;
        assert_eq!(outcome.report().unwrap().exhausted.len(), ids.len());

        let logged: Vec<String> = h.engine.take_exhausted().into_iter().map(|e| e.item.id).collect();
        assert_eq!(logged.len(), EXHAUSTED_LOG_CAPACITY);
        assert_eq!(logged, ids[overflow..].to_vec());
        assert!(h.engine.take_exhausted().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_queue_faults_without_submitting() {
        struct Corrupt;
        impl crate::queue::store::QueueBackend for Corrupt {
            fn load(&self) -> crate::queue::errors::StoreResult<Vec<QueueItem>> {
                Err(crate::queue::errors::StoreError::CorruptedData("eof".to_string()))
            }
            fn persist(&self, _: &[QueueItem]) -> crate::queue::errors::StoreResult<()> {
                Ok(())
            }
            fn describe(&self) -> String {
                "corrupt".to_string()
            }
        }

        let remote = Arc::new(MockRemote::new());
        let status = Arc::new(SyncStatusTracker::new());
        let engine = FlushEngine::new(
            Arc::new(QueueStore::new(Arc::new(Corrupt))),
            remote.clone(),
            status.clone(),
            Arc::new(ConflictDetector::new()),
            Arc::new(InvalidationCoordinator::new()),
            FlushConfig::default(),
        )
        .unwrap();

        let outcome = engine.flush().await;

        assert!(matches!(outcome, FlushOutcome::Faulted(FlushError::Store(_))));
        assert_eq!(status.phase(), SyncPhase::Error);
        assert_eq!(remote.submission_count(), 0);
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn test_concurrent_flush_is_skipped() {
        let h = harness();
        push(&h, 3);
        h.remote.set_latency(Duration::from_millis(50));

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.flush().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.engine.is_active());
        assert!(h.engine.flush().await.is_skipped());

        assert!(first.await.unwrap().report().is_some());
        assert_eq!(h.remote.submission_count(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(FlushConfig::default().validate().is_ok());
        let bad = FlushConfig { batch_size: 0, ..FlushConfig::default() };
        assert!(matches!(bad.validate(), Err(FlushError::InvalidConfig(_))));
    }

    #[test]
    fn test_engine_rejects_zero_batch_size() {
        let built = FlushEngine::new(
            Arc::new(QueueStore::in_memory()),
            Arc::new(MockRemote::new()),
            Arc::new(SyncStatusTracker::new()),
            Arc::new(ConflictDetector::new()),
            Arc::new(InvalidationCoordinator::new()),
            FlushConfig { batch_size: 0, ..FlushConfig::default() },
        );
        assert!(matches!(built, Err(FlushError::InvalidConfig(_))));
    }
}
