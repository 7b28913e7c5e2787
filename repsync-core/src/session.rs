//! One sync session: the queue and everything that works on it
//!
//! Constructed once per process and shared by reference. Components are
//! public so hosts can subscribe to what they need.

use crate::conflict::{ConflictDetector, ConflictResolver};
use crate::flush::engine::{FlushConfig, FlushEngine};
use crate::flush::errors::FlushResult;
use crate::flush::status::SyncStatusTracker;
use crate::invalidation::InvalidationCoordinator;
use crate::queue::enqueuer::Enqueuer;
use crate::queue::store::QueueStore;
use crate::remote::RemoteService;
use crate::trigger::{Environment, TriggerController};
use std::sync::Arc;

pub struct SyncSession {
    pub store: Arc<QueueStore>,
    pub status: Arc<SyncStatusTracker>,
    pub detector: Arc<ConflictDetector>,
    pub invalidation: Arc<InvalidationCoordinator>,
    pub engine: Arc<FlushEngine>,
    pub enqueuer: Enqueuer,
    pub resolver: ConflictResolver,
}

impl SyncSession {
    /// Wire a session around `store`. Rejects an unusable `config`.
    pub fn new(
        store: Arc<QueueStore>,
        remote: RemoteService,
        invalidation: InvalidationCoordinator,
        config: FlushConfig,
    ) -> FlushResult<Self> {
        let status = Arc::new(SyncStatusTracker::new());
        status.set_pending(store.len());

        let detector = Arc::new(ConflictDetector::new());
        let invalidation = Arc::new(invalidation);
        let debounce = config.debounce;

        let engine = Arc::new(FlushEngine::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&status),
            Arc::clone(&detector),
            Arc::clone(&invalidation),
            config,
        )?);
        let enqueuer = Enqueuer::new(Arc::clone(&store), Arc::clone(&status));
        let resolver = ConflictResolver::new(
            Arc::clone(&detector),
            Arc::clone(&store),
            remote,
            Arc::clone(&status),
            Arc::clone(&invalidation),
        )
        .with_debounce(debounce);

        Ok(Self {
            store,
            status,
            detector,
            invalidation,
            engine,
            enqueuer,
            resolver,
        })
    }

    /// Controller firing this session's flushes from `environment`
    pub fn trigger_controller(&self, environment: Arc<dyn Environment>) -> TriggerController {
        let interval = self.engine.config().flush_interval;
        TriggerController::new(Arc::clone(&self.engine), environment, interval)
    }
}
