/*
    invalidation - Derived read view invalidation after delivery

    After writes reach the remote, any locally cached view derived from
    the affected entities may be stale. The coordinator maps entities to
    views and asks every registered cache to drop them.

    Failures here are logged and swallowed. A write that was delivered
    stays delivered even if a cache refuses to invalidate.
*/

use crate::metrics;
use crate::queue::item::{EntityKind, EntityRef};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvalidationError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

pub type InvalidationResult<T> = Result<T, InvalidationError>;

/// A derived read view that can go stale
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReadView {
    /// Recent-items list for one kind
    RecentItems(EntityKind),
    /// Detail view of a single entity
    EntityDetail(EntityRef),
    /// Totals, volume, personal records
    AggregateStats,
    /// Cross-entity insights
    Insights,
}

impl fmt::Display for ReadView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadView::RecentItems(kind) => write!(f, "recent:{}", kind),
            ReadView::EntityDetail(entity) => write!(f, "detail:{}", entity),
            ReadView::AggregateStats => write!(f, "stats"),
            ReadView::Insights => write!(f, "insights"),
        }
    }
}

/// Views a change to `entity` can make stale
pub fn views_for(entity: &EntityRef) -> Vec<ReadView> {
    let mut views = vec![
        ReadView::RecentItems(entity.kind),
        ReadView::EntityDetail(entity.clone()),
    ];
    match entity.kind {
        EntityKind::Workout | EntityKind::Exercise | EntityKind::BodyMetric | EntityKind::Settings => {
            views.push(ReadView::AggregateStats);
            views.push(ReadView::Insights);
        }
        EntityKind::Template => {}
    }
    views
}

/// A cache holding derived read views
#[async_trait]
pub trait ReadViewCache: Send + Sync {
    async fn invalidate(&self, view: &ReadView) -> InvalidationResult<()>;
}

/// Outcome of one invalidation round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationReport {
    pub invalidated: Vec<ReadView>,
    pub failed: Vec<(ReadView, InvalidationError)>,
}

#[derive(Default)]
pub struct InvalidationCoordinator {
    caches: Vec<Arc<dyn ReadViewCache>>,
    rounds: AtomicUsize,
}

impl InvalidationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: Arc<dyn ReadViewCache>) -> Self {
        self.caches.push(cache);
        self
    }

    /// Number of invalidation rounds run so far
    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }

    /// Invalidate every view derived from `entities`
    ///
    /// Each view is invalidated once even when several entities map to it.
    pub async fn invalidate_entities(&self, entities: &[EntityRef]) -> InvalidationReport {
        let views: BTreeSet<ReadView> = entities.iter().flat_map(views_for).collect();
        let mut report = InvalidationReport::default();
        self.rounds.fetch_add(1, Ordering::SeqCst);

        debug!(entities = entities.len(), views = views.len(), "invalidating read views");

        for view in views {
            let mut ok = true;
            for cache in &self.caches {
                if let Err(e) = cache.invalidate(&view).await {
                    warn!(view = %view, error = %e, "read view invalidation failed");
                    metrics::record_counter(metrics::INVALIDATION_FAILED, 1);
                    report.failed.push((view.clone(), e));
                    ok = false;
                }
            }
            if ok {
                report.invalidated.push(view);
            }
        }

        report
    }
}

/// Cache that records what it was asked to drop
///
/// Used by tests. Views listed in `failing` are refused.
#[derive(Default)]
pub struct RecordingCache {
    invalidated: Mutex<Vec<ReadView>>,
    failing: Mutex<HashSet<ReadView>>,
}

impl RecordingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, view: ReadView) {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).insert(view);
    }

    /// Every view invalidated so far, in order
    pub fn invalidated(&self) -> Vec<ReadView> {
        self.invalidated.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Entities whose detail view was invalidated
    pub fn invalidated_entities(&self) -> Vec<EntityRef> {
        self.invalidated()
            .into_iter()
            .filter_map(|view| match view {
                ReadView::EntityDetail(entity) => Some(entity),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ReadViewCache for RecordingCache {
    async fn invalidate(&self, view: &ReadView) -> InvalidationResult<()> {
        if self.failing.lock().unwrap_or_else(PoisonError::into_inner).contains(view) {
            return Err(InvalidationError::Unavailable(format!("{} is locked", view)));
        }
        self.invalidated.lock().unwrap_or_else(PoisonError::into_inner).push(view.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_for_workout_cover_stats_and_insights() {
        let views = views_for(&EntityRef::workout("1"));
        assert!(views.contains(&ReadView::RecentItems(EntityKind::Workout)));
        assert!(views.contains(&ReadView::EntityDetail(EntityRef::workout("1"))));
        assert!(views.contains(&ReadView::AggregateStats));
        assert!(views.contains(&ReadView::Insights));
    }

    #[test]
    fn test_templates_do_not_touch_stats() {
        let views = views_for(&EntityRef::template("t"));
        assert_eq!(views.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_views_invalidated_once() {
        let cache = Arc::new(RecordingCache::new());
        let coordinator = InvalidationCoordinator::new().with_cache(cache.clone());

        let report = coordinator
            .invalidate_entities(&[EntityRef::workout("1"), EntityRef::workout("2")])
            .await;

        let stats_count = cache
            .invalidated()
            .iter()
            .filter(|v| **v == ReadView::AggregateStats)
            .count();
        assert_eq!(stats_count, 1);
        // recent list, stats, insights, two detail views
        assert_eq!(report.invalidated.len(), 5);
        assert!(report.failed.is_empty());
        assert_eq!(coordinator.rounds(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_raised() {
        let cache = Arc::new(RecordingCache::new());
        cache.fail_on(ReadView::Insights);
        let coordinator = InvalidationCoordinator::new().with_cache(cache.clone());

        let report = coordinator.invalidate_entities(&[EntityRef::workout("1")]).await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, ReadView::Insights);
        assert!(cache.invalidated().contains(&ReadView::AggregateStats));
    }
}
