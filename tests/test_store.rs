mod common;

use common::submission;
use daqroc_runner_lib::queue::models::{RunDuration, RunResults};
use daqroc_runner_lib::queue::TestStatus;
use daqroc_runner_lib::store::{JsonTestStore, StoreError, TestStore};

fn results(end_time: &str) -> RunResults {
    RunResults {
        results_path: Some("tests/alice/results_1.csv".into()),
        end_time: end_time.to_string(),
        duration: RunDuration::Seconds(42),
    }
}

#[tokio::test]
async fn test_lifecycle_and_terminal_finality() {
    let store = JsonTestStore::in_memory();
    let id = store.create_queued(&submission("alice", "LDPC1", "0:1:5", 3)).await.unwrap();

    let record = store.get_by_id(id).await.unwrap();
    assert_eq!(record.status, TestStatus::Queued);
    assert_eq!(record.snr_range, "0:1:5");
    assert_eq!(record.batch_size, 3);
    assert!(record.start_time.is_none());

    store.set_status(id, TestStatus::Running).await.unwrap();
    assert!(store.get_by_id(id).await.unwrap().start_time.is_some());

    store.set_results(id, results("2024-01-01T00:05:00.000Z")).await.unwrap();
    store.set_status(id, TestStatus::Completed).await.unwrap();

    let record = store.get_by_id(id).await.unwrap();
    assert_eq!(record.status, TestStatus::Completed);
    assert_eq!(record.duration.as_deref(), Some("42"));
    assert_eq!(record.end_time.as_deref(), Some("2024-01-01T00:05:00.000Z"));

    for next in [TestStatus::Queued, TestStatus::Running, TestStatus::Failed] {
        assert!(matches!(
            store.set_status(id, next).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }
    assert_eq!(store.get_by_id(id).await.unwrap().status, TestStatus::Completed);
}

#[tokio::test]
async fn test_ids_are_unique_and_missing_ids_report_not_found() {
    let store = JsonTestStore::in_memory();
    let a = store.create_queued(&submission("alice", "LDPC1", "0:1:5", 3)).await.unwrap();
    let b = store.create_queued(&submission("bob", "LDPC1", "0:1:5", 3)).await.unwrap();
    assert_ne!(a, b);

    assert!(matches!(store.get_by_id(999).await, Err(StoreError::NotFound(999))));
    assert!(matches!(store.set_status(999, TestStatus::Running).await, Err(StoreError::NotFound(999))));
}

#[tokio::test]
async fn test_duration_not_available_is_stored_as_sentinel() {
    let store = JsonTestStore::in_memory();
    let id = store.create_queued(&submission("alice", "LDPC1", "0:1:5", 3)).await.unwrap();
    store.set_status(id, TestStatus::Failed).await.unwrap();
    store
        .set_results(
            id,
            RunResults {
                results_path: None,
                end_time: "2024-01-01T00:05:00.000Z".to_string(),
                duration: RunDuration::NotAvailable,
            },
        )
        .await
        .unwrap();
    assert_eq!(store.get_by_id(id).await.unwrap().duration.as_deref(), Some("N/A"));
}

#[tokio::test]
async fn test_file_store_reloads_and_fails_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db").join("tests.json");

    let (done, running, queued) = {
        let store = JsonTestStore::open(&path).await.unwrap();
        let done = store.create_queued(&submission("alice", "LDPC1", "0:1:5", 3)).await.unwrap();
        let running = store.create_queued(&submission("alice", "LDPC1", "0:1:5", 3)).await.unwrap();
        let queued = store.create_queued(&submission("bob", "LDPC2", "0:1:5", 3)).await.unwrap();
        store.set_status(done, TestStatus::Running).await.unwrap();
        store.set_results(done, results("2024-01-01T00:05:00.000Z")).await.unwrap();
        store.set_status(done, TestStatus::Completed).await.unwrap();
        store.set_status(running, TestStatus::Running).await.unwrap();
        (done, running, queued)
    };

    let store = JsonTestStore::open(&path).await.unwrap();
    assert_eq!(store.all().await.len(), 3);
    assert_eq!(store.get_by_id(done).await.unwrap().status, TestStatus::Completed);

    for id in [running, queued] {
        let record = store.get_by_id(id).await.unwrap();
        assert_eq!(record.status, TestStatus::Failed);
        assert!(record.end_time.is_some());
    }

    let next = store.create_queued(&submission("carol", "LDPC1", "0:1:5", 3)).await.unwrap();
    assert!(next > queued);
}

#[tokio::test]
async fn test_corrupt_store_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tests.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(JsonTestStore::open(&path).await, Err(StoreError::Json(_))));
}
