//! Async test helpers
//!
//! Waiting on the watch channels the sync layer publishes, with a bound
//! so a broken test fails instead of hanging.

use crate::flush::status::{SyncPhase, SyncStatusTracker};
use crate::queue::store::QueueStore;
use std::future::Future;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

/// Default timeout for tests
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Short timeout for tests that should fail fast
pub const SHORT_TEST_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Closed,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "condition not reached in time"),
            WaitError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Run a future with a timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, WaitError>
where
    F: Future<Output = T>,
{
    timeout(duration, future).await.map_err(|_| WaitError::Timeout)
}

/// Wait until a watch channel holds a value matching `pred`
pub async fn wait_until<T, P>(
    rx: &mut watch::Receiver<T>,
    duration: Duration,
    mut pred: P,
) -> Result<(), WaitError>
where
    P: FnMut(&T) -> bool,
{
    with_timeout(duration, async {
        loop {
            if pred(&rx.borrow_and_update()) {
                return Ok(());
            }
            rx.changed().await.map_err(|_| WaitError::Closed)?;
        }
    })
    .await?
}

/// Wait for the tracker to enter `phase`
pub async fn wait_for_phase(
    status: &SyncStatusTracker,
    phase: SyncPhase,
    duration: Duration,
) -> Result<(), WaitError> {
    let mut rx = status.subscribe_phase();
    wait_until(&mut rx, duration, |current| *current == phase).await
}

/// Wait for the queue to reach `depth`
pub async fn wait_for_depth(
    store: &QueueStore,
    depth: usize,
    duration: Duration,
) -> Result<(), WaitError> {
    let mut rx = store.subscribe();
    wait_until(&mut rx, duration, |current| *current == depth).await
}
