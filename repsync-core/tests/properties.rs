/*
    properties.rs - Queue and engine guarantees

    Invariants that must hold for any sequence of enqueues and passes:
    no item is lost or duplicated, failed items keep their place ahead of
    newer writes, and exhaustion is reported exactly once.
*/

use proptest::prelude::*;
use repsync_core::conflict::ConflictResolution;
use repsync_core::flush::{FlushConfig, SyncPhase};
use repsync_core::queue::{EntityRef, WriteIntent};
use repsync_core::remote::RemoteError;
use repsync_core::test_utils::{fast_flush_config, workout_data, workout_intent, TestSession};
use repsync_core::trigger::{ManualEnvironment, TriggerReason};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_empty_flush_is_idempotent() {
    let t = TestSession::new();

    for _ in 0..3 {
        let outcome = t.session.engine.flush().await;
        assert!(outcome.report().unwrap().is_noop());
        assert_eq!(t.session.status.phase(), SyncPhase::Done);
    }

    assert_eq!(t.remote.submission_count(), 0);
    assert_eq!(t.session.invalidation.rounds(), 0);

    let status = t.session.status.snapshot();
    assert_eq!(status.pending_operations, 0);
    assert!(status.last_error.is_none());
    assert!(status.last_sync_at.is_none());
}

#[tokio::test]
async fn test_concurrent_triggers_submit_each_item_once() {
    let t = TestSession::new();
    t.remote.set_latency(Duration::from_millis(50));
    for i in 0..3 {
        t.session
            .enqueuer
            .enqueue_save(workout_intent(&format!("w-{}", i), "Legs"));
    }

    let env = Arc::new(ManualEnvironment::new(true));
    let controller = t.session.trigger_controller(env);

    let first = controller.retry_now().expect("online with work queued");
    tokio::task::yield_now().await;
    let second = controller.request_flush(TriggerReason::Foreground);
    let third = controller.retry_now();

    let outcome = first.await.unwrap();
    assert_eq!(outcome.report().unwrap().delivered.len(), 3);

    for handle in [second, third].into_iter().flatten() {
        assert!(handle.await.unwrap().is_skipped());
    }

    let ids = t.remote.submitted_item_ids();
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(unique.len(), 3);
    assert_eq!(t.remote.submission_count(), 1);
}

#[tokio::test]
async fn test_exhaustion_reported_exactly_once() {
    let t = TestSession::with_config(FlushConfig {
        max_attempts: 3,
        ..fast_flush_config()
    });
    let mut rx = t.session.engine.subscribe_exhausted();
    t.session.enqueuer.enqueue_save(workout_intent("w-1", "Arms"));
    t.remote.fail_always(RemoteError::Timeout);

    let mut reported = 0;
    for _ in 0..6 {
        let outcome = t.session.engine.flush().await;
        reported += outcome.report().unwrap().exhausted.len();
    }

    assert_eq!(reported, 1);
    assert_eq!(t.remote.submission_count(), 3);
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
    assert_eq!(t.session.engine.take_exhausted().len(), 1);
    assert!(t.session.engine.take_exhausted().is_empty());
    assert_eq!(t.session.status.snapshot().failed_operations, 1);
}

#[tokio::test]
async fn test_failed_items_retry_before_newer_writes() {
    let t = TestSession::new();
    let a = t.session.enqueuer.enqueue_save(workout_intent("a", "A"));
    let b = t.session.enqueuer.enqueue_save(workout_intent("b", "B"));

    t.remote.fail_next(RemoteError::Server {
        status: 503,
        message: "maintenance".to_string(),
    });
    let outcome = t.session.engine.flush().await;
    assert_eq!(outcome.report().unwrap().requeued, vec![a.clone(), b.clone()]);

    let c = t.session.enqueuer.enqueue_save(workout_intent("c", "C"));
    t.session.engine.flush().await;

    let second: Vec<String> = t.remote.submissions()[1]
        .iter()
        .map(|item| item.id.clone())
        .collect();
    assert_eq!(second, vec![a, b, c]);
    assert!(t.session.store.is_empty());
}

#[tokio::test]
async fn test_unresolved_conflict_defaults_to_remote() {
    let t = TestSession::new();
    let entity = EntityRef::workout("1");
    let base = t.remote.seed(entity.clone(), workout_data("Old", &["squat"]));
    t.session.enqueuer.enqueue_save(
        WriteIntent::new(entity.clone(), workout_data("Mine", &["squat"])).based_on(base),
    );
    let remote_version = t
        .remote
        .external_edit(entity.clone(), workout_data("Theirs", &["squat"]));

    t.session.engine.flush().await;
    let record = t.session.detector.pending().pop().unwrap();

    let report = t.session.resolver.finalize(&HashMap::new()).await.unwrap();
    assert_eq!(report.resolved, vec![(record.id, ConflictResolution::Remote)]);

    let stored = t.remote.entity(&entity).unwrap();
    assert_eq!(stored.data["name"], "Theirs");
    assert_eq!(stored.updated_at, remote_version);
    assert!(t.session.store.is_empty());
}

#[derive(Debug, Clone)]
enum Op {
    Enqueue,
    Flush { fail: bool },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Enqueue),
        2 => any::<bool>().prop_map(|fail| Op::Flush { fail }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_queue_length_accounts_for_every_item(ops in prop::collection::vec(op(), 0..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let t = TestSession::with_config(FlushConfig {
                batch_size: 2,
                max_attempts: 2,
                ..fast_flush_config()
            });

            let mut enqueued = 0usize;
            let mut delivered = 0usize;
            let mut exhausted = 0usize;

            for (n, op) in ops.iter().enumerate() {
                match op {
                    Op::Enqueue => {
                        t.session.enqueuer.enqueue_save(workout_intent(&format!("w-{}", n), "P"));
                        enqueued += 1;
                    }
                    Op::Flush { fail } => {
                        if *fail {
                            t.remote.fail_always(RemoteError::Network("down".to_string()));
                        } else {
                            t.remote.recover();
                        }
                        let outcome = t.session.engine.flush().await;
                        let report = outcome.report().unwrap();
                        delivered += report.delivered.len();
                        exhausted += report.exhausted.len();
                    }
                }

                let depth = t.session.store.len();
                prop_assert_eq!(depth, enqueued - (delivered + exhausted));
                prop_assert_eq!(t.session.status.snapshot().pending_operations, depth);
            }

            let ids = t.remote.submitted_item_ids();
            let accepted: HashSet<&String> = ids.iter().collect();
            prop_assert!(accepted.len() >= delivered);
            Ok(())
        })?;
    }
}
