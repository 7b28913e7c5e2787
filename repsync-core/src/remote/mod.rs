/*
    Remote subsystem - The backing service as seen by the sync layer

    The remote is treated as two endpoints:
    - a batched write accepting an ordered list of queue items, with one
      all-or-nothing outcome for the whole batch
    - a per-entity fetch, used when a write is rejected for version
      divergence
*/

pub mod errors;
pub mod http;
pub mod mock;

use crate::queue::item::{EntityRef, QueueItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use errors::{RemoteError, RemoteResult};
pub use http::HttpRemote;
pub use mock::MockRemote;

/// Current remote state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub entity: EntityRef,
    pub updated_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// The backing service
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Deliver a batch of queued writes in order
    ///
    /// Either every item is applied or none is. Transport timeouts are
    /// reported as `RemoteError::Timeout`.
    async fn submit_batch(&self, items: &[QueueItem]) -> RemoteResult<()>;

    /// Fetch the current remote snapshot of an entity
    async fn fetch_entity(&self, entity: &EntityRef) -> RemoteResult<RemoteEntity>;
}

/// Shared handle to a remote implementation
pub type RemoteService = Arc<dyn RemoteApi>;
