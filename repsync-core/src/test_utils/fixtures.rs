//! Test fixtures
//!
//! Sample domain payloads and a fully wired in-memory session.

use crate::flush::engine::FlushConfig;
use crate::invalidation::{InvalidationCoordinator, RecordingCache};
use crate::queue::item::{EntityKind, EntityRef, WriteIntent};
use crate::queue::store::QueueStore;
use crate::remote::MockRemote;
use crate::session::SyncSession;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Workout body with one exercise per name
pub fn workout_data(name: &str, exercises: &[&str]) -> Value {
    json!({
        "name": name,
        "exercises": exercises
            .iter()
            .map(|e| json!({ "id": e, "sets": 3 }))
            .collect::<Vec<_>>(),
    })
}

/// Save intent for a new workout
pub fn workout_intent(id: &str, name: &str) -> WriteIntent {
    WriteIntent::new(EntityRef::workout(id), workout_data(name, &["squat"]))
}

/// Save intent for a new template
pub fn template_intent(id: &str, name: &str) -> WriteIntent {
    WriteIntent::new(EntityRef::template(id), workout_data(name, &["bench"]))
}

pub fn body_metric_intent(id: &str, weight_kg: f64) -> WriteIntent {
    WriteIntent::new(
        EntityRef::new(EntityKind::BodyMetric, id),
        json!({ "weightKg": weight_kg }),
    )
}

/// Engine settings with a short debounce so phases settle quickly
pub fn fast_flush_config() -> FlushConfig {
    FlushConfig {
        debounce: Duration::from_millis(20),
        ..FlushConfig::default()
    }
}

/// In-memory session wired to a mock remote and a recording cache
pub struct TestSession {
    pub session: SyncSession,
    pub remote: Arc<MockRemote>,
    pub cache: Arc<RecordingCache>,
}

impl TestSession {
    pub fn new() -> Self {
        Self::with_config(fast_flush_config())
    }

    pub fn with_config(config: FlushConfig) -> Self {
        let remote = Arc::new(MockRemote::new());
        let cache = Arc::new(RecordingCache::new());
        let session = SyncSession::new(
            Arc::new(QueueStore::in_memory()),
            remote.clone(),
            InvalidationCoordinator::new().with_cache(cache.clone()),
            config,
        )
        .expect("test flush config is valid");
        Self { session, remote, cache }
    }
}

impl Default for TestSession {
    fn default() -> Self {
        Self::new()
    }
}
