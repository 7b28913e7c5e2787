//! End-to-end tests for the `repsync` binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn repsync(queue: &Path) -> Command {
    let mut cmd = Command::cargo_bin("repsync").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("REPSYNC_REMOTE_BASE_URL")
        .arg("--queue")
        .arg(queue);
    cmd
}

#[test]
fn test_list_empty_queue() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue.json");

    repsync(&queue)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("queue is empty"));
}

#[test]
fn test_enqueue_then_list() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("nested").join("queue.json");

    repsync(&queue)
        .args(["enqueue", "--kind", "workout", "--id", "w-1"])
        .args(["--data", r#"{"name":"Leg day","exercises":[]}"#])
        .assert()
        .success();

    repsync(&queue)
        .args(["enqueue", "--kind", "template", "--id", "t-1", "--delete"])
        .assert()
        .success();

    assert!(queue.exists());

    repsync(&queue)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("workout_save"))
        .stdout(predicate::str::contains("workout:w-1"))
        .stdout(predicate::str::contains("template_delete"));
}

#[test]
fn test_list_json_is_parseable() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue.json");

    repsync(&queue)
        .args(["enqueue", "--kind", "body_metric", "--id", "m-1"])
        .args(["--data", r#"{"weight":80.5}"#])
        .args(["--base", "2024-03-01T10:00:00Z"])
        .assert()
        .success();

    let output = repsync(&queue).args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());

    let items: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["type"], "body_metric_save");
    assert_eq!(items[0]["attempts"], 0);
    assert_eq!(items[0]["payload"]["data"]["weight"], 80.5);
}

#[test]
fn test_status_reports_depth() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue.json");

    for id in ["w-1", "w-2"] {
        repsync(&queue)
            .args(["enqueue", "--kind", "workout", "--id", id])
            .assert()
            .success();
    }

    repsync(&queue)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""pendingOperations": 2"#))
        .stdout(predicate::str::contains(r#""retrying": 0"#));
}

#[test]
fn test_enqueue_rejects_unknown_kind() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue.json");

    repsync(&queue)
        .args(["enqueue", "--kind", "playlist", "--id", "p-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown entity kind"));

    assert!(!queue.exists());
}

#[test]
fn test_enqueue_rejects_bad_json() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue.json");

    repsync(&queue)
        .args(["enqueue", "--kind", "workout", "--id", "w-1", "--data", "{nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not valid JSON"));
}

#[test]
fn test_invalid_log_level() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue.json");

    repsync(&queue)
        .args(["--log-level", "loud", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid log level"));
}

#[test]
fn test_flush_without_remote_fails() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue.json");

    repsync(&queue)
        .arg("flush")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no remote configured"));
}

#[test]
fn test_flush_unreachable_remote_requeues() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue.json");

    repsync(&queue)
        .args(["enqueue", "--kind", "workout", "--id", "w-1"])
        .assert()
        .success();

    // Nothing listens on port 1
    repsync(&queue)
        .args(["flush", "--remote", "http://127.0.0.1:1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("delivered=0 requeued=1"));

    repsync(&queue)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""retrying": 1"#));
}

#[test]
fn test_config_file_sets_queue_path() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("from-config.json");
    let config = dir.path().join("repsync.toml");
    std::fs::write(
        &config,
        format!("[store]\nqueue_path = {:?}\n", queue.display().to_string()),
    )
    .unwrap();

    Command::cargo_bin("repsync")
        .unwrap()
        .env_remove("REPSYNC_STORE_QUEUE_PATH")
        .arg("--config")
        .arg(&config)
        .args(["enqueue", "--kind", "settings", "--id", "me"])
        .assert()
        .success();

    assert!(queue.exists());
}

#[test]
fn test_run_accepts_conflict_policy() {
    let dir = TempDir::new().unwrap();
    repsync(&dir.path().join("queue.json"))
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--on-conflict"));
}

#[test]
fn test_enqueue_refuses_corrupt_queue_file() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue.json");
    std::fs::write(&queue, "[{\"id\": ").unwrap();

    repsync(&queue)
        .args(["enqueue", "--kind", "workout", "--id", "w-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not be written"));

    assert_eq!(std::fs::read_to_string(&queue).unwrap(), "[{\"id\": ");
}
