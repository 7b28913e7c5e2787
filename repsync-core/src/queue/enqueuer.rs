//! Enqueuer: the write path used by the app while online or offline.
//!
//! Enqueueing never touches the network and never checks connectivity.
//! It always succeeds and returns the new item id immediately.

use crate::flush::status::SyncStatusTracker;
use crate::metrics;
use crate::queue::item::{ItemType, QueueItem, WriteIntent};
use crate::queue::store::QueueStore;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<QueueStore>,
    status: Arc<SyncStatusTracker>,
}

impl Enqueuer {
    pub fn new(store: Arc<QueueStore>, status: Arc<SyncStatusTracker>) -> Self {
        Self { store, status }
    }

    /// Queue a write intent and return its id
    pub fn enqueue(&self, item_type: ItemType, payload: WriteIntent) -> String {
        let item = QueueItem::new(item_type, payload);
        let id = item.id.clone();

        debug!(
            item_id = %id,
            item_type = %item.item_type,
            entity = %item.entity(),
            "enqueueing write intent"
        );

        self.store.append(item);
        self.status.set_pending(self.store.len());
        metrics::record_counter(metrics::QUEUE_ENQUEUED, 1);

        id
    }

    /// Queue a save for the intent's entity kind
    pub fn enqueue_save(&self, payload: WriteIntent) -> String {
        let item_type = ItemType::save_for(payload.entity.kind);
        self.enqueue(item_type, payload)
    }
}
