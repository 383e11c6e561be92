//! Integration tests for the job store.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use jobcast::error::Error;
use jobcast::model::*;
use jobcast::store::{JobStore, StoreLimits};
use toml::Table;

fn test_store(max_jobs: usize) -> JobStore {
    JobStore::new(StoreLimits {
        max_jobs,
        retention: Duration::from_secs(3600),
    })
}

fn payload(value: i64) -> Table {
    let mut table = Table::new();
    table.insert("value".to_string(), toml::Value::Integer(value));
    table
}

async fn run_to(store: &JobStore, id: &JobId, status: JobStatus) {
    store.update_status(id, JobStatus::Running).await.unwrap();
    match status {
        JobStatus::Completed => store.complete(id, None).await.unwrap(),
        JobStatus::Failed => store.fail(id, "boom").await.unwrap(),
        JobStatus::Duplicate => store.mark_duplicate(id).await.unwrap(),
        other => panic!("not a terminal status: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Create / read
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_is_create_if_absent() {
    let store = test_store(10);
    let id = JobId::from("a1");

    assert!(store.create(id.clone(), payload(1)).await);
    let original = store.get(&id).await.unwrap();

    assert!(!store.create(id.clone(), payload(2)).await);
    let after = store.get(&id).await.unwrap();

    assert_eq!(after, original);
    assert_eq!(after.status, JobStatus::Pending);
    assert_eq!(after.input, payload(1));
    assert_eq!(after.attempts, 1);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn unknown_id_reads_as_absent() {
    let store = test_store(10);
    let id = JobId::from("missing");

    assert!(store.get(&id).await.is_none());
    assert!(!store.contains(&id).await);
    assert!(store.status(&id).await.is_none());
    assert!(matches!(
        store.update_status(&id, JobStatus::Running).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn snapshots_are_copies() {
    let store = test_store(10);
    let id = JobId::from("snap");
    store.create(id.clone(), payload(1)).await;

    let mut snapshot = store.get(&id).await.unwrap();
    snapshot.status = JobStatus::Failed;

    assert_eq!(store.status(&id).await, Some(JobStatus::Pending));
}

#[tokio::test]
async fn list_filters_by_status() {
    let store = test_store(10);
    for name in ["p", "c", "f"] {
        store.create(JobId::from(name), payload(0)).await;
    }
    run_to(&store, &JobId::from("c"), JobStatus::Completed).await;
    run_to(&store, &JobId::from("f"), JobStatus::Failed).await;

    assert_eq!(store.list(None).await.len(), 3);
    let completed = store.list(Some(JobStatus::Completed)).await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, JobId::from("c"));
    assert_eq!(store.list(Some(JobStatus::Failed)).await.len(), 1);
    assert_eq!(store.list(Some(JobStatus::Pending)).await.len(), 1);
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminal_statuses_stamp_completion_time() {
    for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Duplicate] {
        let store = test_store(10);
        let id = JobId::from("t");
        store.create(id.clone(), payload(0)).await;
        run_to(&store, &id, status).await;

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, status);
        let completed_at = record.completed_at.expect("completion time stamped");
        assert!(completed_at >= record.created_at);
    }
}

#[tokio::test]
async fn completion_attaches_result_and_failure_attaches_error() {
    let store = test_store(10);
    let ok = JobId::from("ok");
    let bad = JobId::from("bad");
    store.create(ok.clone(), payload(1)).await;
    store.create(bad.clone(), payload(2)).await;

    store.update_status(&ok, JobStatus::Running).await.unwrap();
    let envelope = ResultEnvelope::new(ok.clone(), payload(42)).topic("results/x");
    store.complete(&ok, Some(envelope.clone())).await.unwrap();

    store.update_status(&bad, JobStatus::Running).await.unwrap();
    store.fail(&bad, "division by zero").await.unwrap();

    let ok_record = store.get(&ok).await.unwrap();
    assert_eq!(ok_record.result, Some(envelope));
    assert!(ok_record.error.is_none());

    let bad_record = store.get(&bad).await.unwrap();
    assert_eq!(bad_record.error.as_deref(), Some("division by zero"));
    assert!(bad_record.result.is_none());
}

#[tokio::test]
async fn invalid_transition_errors() {
    let store = test_store(10);
    let id = JobId::from("x");
    store.create(id.clone(), payload(0)).await;

    // Pending jobs must start running before they can complete.
    let result = store.complete(&id, None).await;
    assert!(matches!(
        result,
        Err(Error::InvalidTransition {
            from: JobStatus::Pending,
            to: JobStatus::Completed
        })
    ));
    assert_eq!(store.status(&id).await, Some(JobStatus::Pending));

    run_to(&store, &id, JobStatus::Completed).await;
    assert!(store.update_status(&id, JobStatus::Running).await.is_err());
}

#[tokio::test]
async fn reprocess_resets_record_and_counts_attempts() {
    let store = test_store(10);
    let id = JobId::from("again");
    store.create(id.clone(), payload(1)).await;
    run_to(&store, &id, JobStatus::Failed).await;

    let attempts = store.reprocess(&id, payload(2)).await.unwrap();
    assert_eq!(attempts, 2);

    let record = store.get(&id).await.unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.input, payload(2));
    assert!(record.completed_at.is_none());
    assert!(record.error.is_none());
}

#[tokio::test]
async fn reprocess_refuses_running_job() {
    let store = test_store(10);
    let id = JobId::from("busy");
    store.create(id.clone(), payload(1)).await;
    store.update_status(&id, JobStatus::Running).await.unwrap();

    assert!(store.reprocess(&id, payload(2)).await.is_err());
    let record = store.get(&id).await.unwrap();
    assert_eq!(record.status, JobStatus::Running);
    assert_eq!(record.input, payload(1));
}

#[tokio::test]
async fn reprocess_or_create_recreates_evicted_job() {
    let store = test_store(10);
    let id = JobId::from("evicted");

    assert!(matches!(
        store.reprocess(&id, payload(1)).await,
        Err(Error::NotFound(_))
    ));
    let attempts = store.reprocess_or_create(&id, payload(1)).await.unwrap();

    assert_eq!(attempts, 1);
    let record = store.get(&id).await.unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.input, payload(1));
}

#[tokio::test]
async fn reprocess_or_create_resets_existing_job() {
    let store = test_store(10);
    let id = JobId::from("kept");
    store.create(id.clone(), payload(1)).await;
    run_to(&store, &id, JobStatus::Completed).await;

    assert_eq!(store.reprocess_or_create(&id, payload(9)).await.unwrap(), 2);
    assert_eq!(store.status(&id).await, Some(JobStatus::Pending));

    store.update_status(&id, JobStatus::Running).await.unwrap();
    assert!(matches!(
        store.reprocess_or_create(&id, payload(3)).await,
        Err(Error::InvalidTransition {
            from: JobStatus::Running,
            to: JobStatus::Pending
        })
    ));
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn age_pass_removes_only_expired_terminal_jobs() {
    let store = test_store(100);
    for name in ["done", "pending", "running"] {
        store.create(JobId::from(name), payload(0)).await;
    }
    run_to(&store, &JobId::from("done"), JobStatus::Completed).await;
    store
        .update_status(&JobId::from("running"), JobStatus::Running)
        .await
        .unwrap();

    // Within the retention window nothing goes.
    let report = store.evict().await;
    assert_eq!(report.expired, 0);
    assert_eq!(store.len().await, 3);

    let later = Utc::now() + TimeDelta::seconds(3601);
    let report = store.evict_at(later).await;
    assert_eq!(report.expired, 1);
    assert_eq!(report.remaining, 2);
    assert!(!store.contains(&JobId::from("done")).await);
    assert!(store.contains(&JobId::from("pending")).await);
    assert!(store.contains(&JobId::from("running")).await);
}

#[tokio::test]
async fn capacity_pass_removes_oldest_terminal_first() {
    let store = test_store(3);
    let ids: Vec<JobId> = (0..5).map(|i| JobId::new(format!("job-{i}"))).collect();
    for id in &ids {
        store.create(id.clone(), payload(0)).await;
        run_to(&store, id, JobStatus::Completed).await;
    }
    store.create(JobId::from("waiting-1"), payload(0)).await;
    store.create(JobId::from("waiting-2"), payload(0)).await;

    let report = store.evict().await;
    assert_eq!(report.expired, 0);
    assert_eq!(report.reaped, 4);
    assert_eq!(store.len().await, 3);

    // The newest completion survives alongside both pending jobs.
    assert!(store.contains(&ids[4]).await);
    for id in &ids[..4] {
        assert!(!store.contains(id).await);
    }
    assert!(store.contains(&JobId::from("waiting-1")).await);
    assert!(store.contains(&JobId::from("waiting-2")).await);
}

#[tokio::test]
async fn eviction_never_drops_in_flight_jobs() {
    let store = test_store(1);
    for i in 0..3 {
        let id = JobId::new(format!("done-{i}"));
        store.create(id.clone(), payload(0)).await;
        run_to(&store, &id, JobStatus::Duplicate).await;
    }
    store.create(JobId::from("pending"), payload(0)).await;
    store.create(JobId::from("running"), payload(0)).await;
    store
        .update_status(&JobId::from("running"), JobStatus::Running)
        .await
        .unwrap();

    let report = store.evict().await;
    assert_eq!(report.reaped, 3);
    // Pending and running jobs stay even above the maximum.
    assert_eq!(report.remaining, 2);
    assert_eq!(store.status(&JobId::from("pending")).await, Some(JobStatus::Pending));
    assert_eq!(store.status(&JobId::from("running")).await, Some(JobStatus::Running));
}
