//! In-process remote for tests and demos
//!
//! Behaves like the real service: batches are all-or-nothing, writes
//! whose base version is older than the stored entity are rejected with
//! a version conflict, and every accepted write bumps `updated_at`.
//! Failures, latency and outages can be scripted.

use super::{RemoteApi, RemoteEntity, RemoteError, RemoteResult};
use crate::queue::item::{EntityRef, QueueItem};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    entities: HashMap<EntityRef, RemoteEntity>,
    last_timestamp: Option<DateTime<Utc>>,
    scripted_failures: VecDeque<RemoteError>,
    fail_all: Option<RemoteError>,
    fail_fetches: bool,
    latency: Option<Duration>,
    submissions: Vec<Vec<QueueItem>>,
    fetches: Vec<EntityRef>,
}

impl MockState {
    /// Strictly increasing server clock
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

/// Mock remote service
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entity as if it had been synced earlier. Returns its version.
    pub fn seed(&self, entity: EntityRef, data: serde_json::Value) -> DateTime<Utc> {
        let mut state = self.state();
        let updated_at = state.next_timestamp();
        state.entities.insert(
            entity.clone(),
            RemoteEntity { entity, updated_at, data },
        );
        updated_at
    }

    /// Simulate another device changing an entity
    pub fn external_edit(&self, entity: EntityRef, data: serde_json::Value) -> DateTime<Utc> {
        self.seed(entity, data)
    }

    /// Fail the next submit call with `error`
    pub fn fail_next(&self, error: RemoteError) {
        self.state().scripted_failures.push_back(error);
    }

    /// Fail every submit call with `error` until `recover` is called
    pub fn fail_always(&self, error: RemoteError) {
        self.state().fail_all = Some(error);
    }

    pub fn recover(&self) {
        let mut state = self.state();
        state.fail_all = None;
        state.scripted_failures.clear();
        state.fail_fetches = false;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.state().fail_fetches = fail;
    }

    /// Delay every submit call, to keep a flush in flight
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    pub fn entity(&self, entity: &EntityRef) -> Option<RemoteEntity> {
        self.state().entities.get(entity).cloned()
    }

    /// Every submitted batch, including rejected ones, in call order
    pub fn submissions(&self) -> Vec<Vec<QueueItem>> {
        self.state().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }

    /// Item ids of every submitted batch, flattened
    pub fn submitted_item_ids(&self) -> Vec<String> {
        self.state()
            .submissions
            .iter()
            .flat_map(|batch| batch.iter().map(|item| item.id.clone()))
            .collect()
    }

    pub fn fetches(&self) -> Vec<EntityRef> {
        self.state().fetches.clone()
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn submit_batch(&self, items: &[QueueItem]) -> RemoteResult<()> {
        let latency = {
            let mut state = self.state();
            state.submissions.push(items.to_vec());
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();

        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = state.fail_all.clone() {
            return Err(err);
        }

        let conflicts: Vec<EntityRef> = items
            .iter()
            .filter(|item| {
                let base = item.payload.base_updated_at;
                match (state.entities.get(item.entity()), base) {
                    (Some(current), Some(base)) => current.updated_at > base,
                    _ => false,
                }
            })
            .map(|item| item.entity().clone())
            .collect();

        if !conflicts.is_empty() {
            return Err(RemoteError::VersionConflict { entities: conflicts });
        }

        for item in items {
            let entity = item.entity().clone();
            if item.item_type.is_delete() {
                state.entities.remove(&entity);
                continue;
            }
            let updated_at = state.next_timestamp();
            state.entities.insert(
                entity.clone(),
                RemoteEntity {
                    entity,
                    updated_at,
                    data: item.payload.data.clone(),
                },
            );
        }

        Ok(())
    }

    async fn fetch_entity(&self, entity: &EntityRef) -> RemoteResult<RemoteEntity> {
        let mut state = self.state();
        state.fetches.push(entity.clone());

        if state.fail_fetches {
            return Err(RemoteError::Network("connection reset".to_string()));
        }

        state
            .entities
            .get(entity)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(entity.clone()))
    }
}
