//! Process-wide sync status exposed to observers
//!
//! `SyncPhase` is the coarse state shown next to the pending counter.
//! `SyncStatus` carries the counters and timestamps. Both are ephemeral
//! and rebuilt from the queue on the next flush after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Observable sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Flushing,
    /// Writing resolved conflict data to the remote
    Saving,
    Offline,
    Error,
    Done,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Flushing => "flushing",
            SyncPhase::Saving => "saving",
            SyncPhase::Offline => "offline",
            SyncPhase::Error => "error",
            SyncPhase::Done => "done",
        }
    }

    /// Work in progress; connectivity changes must not overwrite these
    pub fn is_busy(&self) -> bool {
        matches!(self, SyncPhase::Flushing | SyncPhase::Saving)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counters and timestamps for the pending/failed indicator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Shared owner of `SyncStatus` and the phase channel
pub struct SyncStatusTracker {
    status: RwLock<SyncStatus>,
    phase_tx: watch::Sender<SyncPhase>,
    /// Bumped on every phase change so stale debounce timers do nothing
    generation: AtomicU64,
    offline: AtomicBool,
}

impl Default for SyncStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusTracker {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(SyncPhase::Idle);
        Self {
            status: RwLock::new(SyncStatus::default()),
            phase_tx,
            generation: AtomicU64::new(0),
            offline: AtomicBool::new(false),
        }
    }

    fn update<F: FnOnce(&mut SyncStatus)>(&self, f: F) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase_tx.subscribe()
    }

    /// Set the phase and return the generation it was set at
    pub fn set_phase(&self, phase: SyncPhase) -> u64 {
        let mut generation = 0;
        self.phase_tx.send_if_modified(|current| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *current = phase;
            true
        });
        generation
    }

    /// Phase to fall back to when no work is in progress
    pub fn resting_phase(&self) -> SyncPhase {
        if self.offline.load(Ordering::SeqCst) {
            SyncPhase::Offline
        } else {
            SyncPhase::Idle
        }
    }

    /// Return to the resting phase, unless the phase changed since `generation`
    pub fn settle_if_unchanged(&self, generation: u64) -> bool {
        let resting = self.resting_phase();
        self.phase_tx.send_if_modified(|current| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            *current = resting;
            true
        })
    }

    /// Set a terminal phase, then settle after `debounce`
    ///
    /// The settle is skipped when something else changed the phase first.
    pub fn finish(self: &Arc<Self>, phase: SyncPhase, debounce: Duration) {
        let generation = self.set_phase(phase);
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            tracker.settle_if_unchanged(generation);
        });
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Record a connectivity change; busy phases are left alone
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        let phase = self.phase();
        if phase.is_busy() {
            return;
        }
        if offline && phase != SyncPhase::Offline {
            self.set_phase(SyncPhase::Offline);
        } else if !offline && phase == SyncPhase::Offline {
            self.set_phase(SyncPhase::Idle);
        }
    }

    /// New queue depth after an enqueue or removal
    pub fn set_pending(&self, depth: usize) {
        self.update(|s| {
            s.pending_operations = depth;
            if depth == 0 {
                s.next_retry_at = None;
            }
        });
    }

    /// A batch failed; the remaining items will be retried at `next_retry_at`
    pub fn record_failure(&self, error: &str, next_retry_at: Option<DateTime<Utc>>) {
        self.update(|s| {
            s.last_error = Some(error.to_string());
            s.next_retry_at = next_retry_at;
        });
    }

    /// Items removed after exhausting their attempts
    pub fn record_exhausted(&self, count: usize, error: &str) {
        self.update(|s| {
            s.failed_operations += count;
            s.last_error = Some(error.to_string());
        });
    }

    /// At least one batch was delivered
    ///
    /// When that leaves the queue empty the failure counters are reset too.
    pub fn record_delivery(&self, at: DateTime<Utc>, depth: usize) {
        self.update(|s| {
            s.last_sync_at = Some(at);
            s.pending_operations = depth;
            if depth == 0 {
                s.failed_operations = 0;
                s.last_error = None;
                s.next_retry_at = None;
            }
        });
    }

    pub fn set_last_error(&self, error: Option<String>) {
        self.update(|s| s.last_error = error);
    }

    /// Acknowledge exhausted items after manual action
    pub fn clear_failures(&self) {
        self.update(|s| {
            s.failed_operations = 0;
            s.last_error = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let tracker = SyncStatusTracker::new();
        assert_eq!(tracker.phase(), SyncPhase::Idle);
        assert_eq!(tracker.snapshot(), SyncStatus::default());
    }

    #[test]
    fn test_settle_skips_when_phase_moved_on() {
        let tracker = SyncStatusTracker::new();
        let done_gen = tracker.set_phase(SyncPhase::Done);
        tracker.set_phase(SyncPhase::Flushing);

        assert!(!tracker.settle_if_unchanged(done_gen));
        assert_eq!(tracker.phase(), SyncPhase::Flushing);

        let done_gen = tracker.set_phase(SyncPhase::Done);
        assert!(tracker.settle_if_unchanged(done_gen));
        assert_eq!(tracker.phase(), SyncPhase::Idle);
    }

    #[test]
    fn test_offline_does_not_interrupt_flushing() {
        let tracker = SyncStatusTracker::new();
        tracker.set_phase(SyncPhase::Flushing);
        tracker.set_offline(true);
        assert_eq!(tracker.phase(), SyncPhase::Flushing);

        let gen = tracker.set_phase(SyncPhase::Done);
        tracker.settle_if_unchanged(gen);
        assert_eq!(tracker.phase(), SyncPhase::Offline);

        tracker.set_offline(false);
        assert_eq!(tracker.phase(), SyncPhase::Idle);
    }

    #[test]
    fn test_exhaustion_survives_until_successful_drain() {
        let tracker = SyncStatusTracker::new();
        tracker.record_exhausted(1, "HTTP 500");
        tracker.set_pending(0);

        let status = tracker.snapshot();
        assert_eq!(status.failed_operations, 1);
        assert_eq!(status.last_error.as_deref(), Some("HTTP 500"));

        tracker.record_delivery(Utc::now(), 0);
        let status = tracker.snapshot();
        assert_eq!(status.failed_operations, 0);
        assert!(status.last_error.is_none());
        assert!(status.last_sync_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_settles_after_debounce() {
        let tracker = Arc::new(SyncStatusTracker::new());
        tracker.finish(SyncPhase::Done, Duration::from_millis(500));
        assert_eq!(tracker.phase(), SyncPhase::Done);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(tracker.phase(), SyncPhase::Idle);
    }

    #[test]
    fn test_phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SyncPhase::Flushing).unwrap(), "\"flushing\"");
        assert_eq!(SyncPhase::Saving.to_string(), "saving");
    }
}
