//! Job registry and completion counter against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chartflow::error::Error;
use chartflow::model::{JobFilter, JobId, JobStatus, NewJob};
use chartflow::store::JobStore;
use chartflow::store::memory::MemoryStore;

const LEASE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn create_job_starts_processing_at_zero() {
    let store = MemoryStore::new();
    let job = store
        .create_job(NewJob::new("charts/2024-01-01.json", 3))
        .await
        .unwrap();

    assert_eq!(job.expected, 3);
    assert_eq!(job.processed, 0);
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.completed_at.is_none());
    assert!(job.notified_at.is_none());

    let fetched = store.get_job(job.id).await.unwrap();
    assert_eq!(fetched.source_ref, "charts/2024-01-01.json");
    assert_eq!(fetched.remaining(), 3);
}

#[tokio::test]
async fn zero_expected_is_invalid() {
    let store = MemoryStore::new();
    let err = store.create_job(NewJob::new("empty", 0)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidJob(_)), "got {err:?}");
    assert!(store.list_jobs(JobFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_idempotency_key_is_rejected() {
    let store = MemoryStore::new();
    let first = NewJob::new("chart-a", 2).idempotency_key("chart-a@v1");
    store.create_job(first).await.unwrap();

    let second = NewJob::new("chart-a", 2).idempotency_key("chart-a@v1");
    let err = store.create_job(second).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(ref k) if k == "chart-a@v1"), "got {err:?}");

    // Jobs without a key never conflict.
    store.create_job(NewJob::new("chart-a", 2)).await.unwrap();
    store.create_job(NewJob::new("chart-a", 2)).await.unwrap();
    assert_eq!(store.list_jobs(JobFilter::default()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let store = MemoryStore::new();
    let id = JobId::new();
    assert!(matches!(store.get_job(id).await, Err(Error::JobNotFound(x)) if x == id));
    assert!(matches!(store.increment(id).await, Err(Error::JobNotFound(x)) if x == id));
    assert!(matches!(store.mark_notified(id).await, Err(Error::JobNotFound(_))));
}

#[tokio::test]
async fn increment_completes_on_last_expected_message() {
    let store = MemoryStore::new();
    let job = store.create_job(NewJob::new("chart", 2)).await.unwrap();

    let first = store.increment(job.id).await.unwrap();
    assert_eq!(first.new_processed, 1);
    assert!(!first.crossed_completion);
    assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Processing);

    let second = store.increment(job.id).await.unwrap();
    assert_eq!(second.new_processed, 2);
    assert_eq!(second.expected, 2);
    assert!(second.crossed_completion);

    let done = store.get_job(job.id).await.unwrap();
    assert!(done.is_completed());
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn increment_after_completion_leaves_job_untouched() {
    let store = MemoryStore::new();
    let job = store.create_job(NewJob::new("chart", 1)).await.unwrap();
    store.increment(job.id).await.unwrap();
    let before = store.get_job(job.id).await.unwrap();

    let err = store.increment(job.id).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyCompleted(x) if x == job.id), "got {err:?}");

    let after = store.get_job(job.id).await.unwrap();
    assert_eq!(after.processed, 1);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.completed_at, before.completed_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_increments_complete_exactly_once() {
    const EXPECTED: u32 = 25;
    const CALLS: usize = 80;

    let store = Arc::new(MemoryStore::new());
    let job = store.create_job(NewJob::new("busy chart", EXPECTED)).await.unwrap();

    let handles: Vec<_> = (0..CALLS)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.increment(job.id).await })
        })
        .collect();

    let mut counted = Vec::new();
    let mut already_completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(r) => counted.push(r),
            Err(Error::AlreadyCompleted(_)) => already_completed += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(counted.len(), EXPECTED as usize);
    assert_eq!(already_completed, CALLS - EXPECTED as usize);

    let crossed: Vec<_> = counted.iter().filter(|r| r.crossed_completion).collect();
    assert_eq!(crossed.len(), 1);
    assert_eq!(crossed[0].new_processed, EXPECTED);

    // Every count from 1 to N was handed out once.
    let mut seen: Vec<u32> = counted.iter().map(|r| r.new_processed).collect();
    seen.sort_unstable();
    assert_eq!(seen, (1..=EXPECTED).collect::<Vec<_>>());

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.processed, EXPECTED);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn processed_never_decreases_or_overshoots() {
    let store = MemoryStore::new();
    let job = store.create_job(NewJob::new("chart", 4)).await.unwrap();

    let mut last = 0;
    for _ in 0..10 {
        let _ = store.increment(job.id).await;
        let now = store.get_job(job.id).await.unwrap().processed;
        assert!(now >= last);
        assert!(now <= 4);
        last = now;
    }
    assert_eq!(last, 4);
}

#[tokio::test]
async fn mark_notified_keeps_first_stamp() {
    let store = MemoryStore::new();
    let job = store.create_job(NewJob::new("chart", 1)).await.unwrap();
    store.increment(job.id).await.unwrap();

    store.mark_notified(job.id).await.unwrap();
    let first = store.get_job(job.id).await.unwrap().notified_at;
    assert!(first.is_some());

    tokio::time::sleep(Duration::from_millis(5)).await;
    store.mark_notified(job.id).await.unwrap();
    assert_eq!(store.get_job(job.id).await.unwrap().notified_at, first);
}

#[tokio::test]
async fn claim_notifications_lists_unnotified_completions() {
    let store = MemoryStore::new();
    let open = store.create_job(NewJob::new("open", 2)).await.unwrap();
    let done = store.create_job(NewJob::new("done", 1)).await.unwrap();
    let handed_off = store.create_job(NewJob::new("handed off", 1)).await.unwrap();

    store.increment(open.id).await.unwrap();
    store.increment(done.id).await.unwrap();
    store.increment(handed_off.id).await.unwrap();
    store.mark_notified(handed_off.id).await.unwrap();

    // Nothing completed before the job was created.
    let earlier = store
        .claim_notifications(done.created_at - chrono::Duration::seconds(1), LEASE, 10)
        .await
        .unwrap();
    assert!(earlier.is_empty());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let now = chrono::Utc::now();

    let pending = store.claim_notifications(now, LEASE, 10).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![done.id]);
}

#[tokio::test]
async fn claimed_notification_is_held_until_lease_expires() {
    let store = MemoryStore::new();
    let done = store.create_job(NewJob::new("done", 1)).await.unwrap();
    store.increment(done.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let lease = Duration::from_millis(30);
    let first = store.claim_notifications(chrono::Utc::now(), lease, 10).await.unwrap();
    assert_eq!(first.len(), 1);
    let second = store.claim_notifications(chrono::Utc::now(), lease, 10).await.unwrap();
    assert!(second.is_empty(), "held by the first claim");

    tokio::time::sleep(Duration::from_millis(40)).await;
    let again = store.claim_notifications(chrono::Utc::now(), lease, 10).await.unwrap();
    assert_eq!(again.len(), 1, "lease expired without a hand-off");

    store.mark_notified(done.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let after = store.claim_notifications(chrono::Utc::now(), lease, 10).await.unwrap();
    assert!(after.is_empty());
}

#[tokio::test]
async fn discard_job_only_removes_jobs_without_progress() {
    let store = MemoryStore::new();
    let fresh = store
        .create_job(NewJob::new("fresh", 2).idempotency_key("week-1"))
        .await
        .unwrap();
    let started = store.create_job(NewJob::new("started", 2)).await.unwrap();
    store.increment(started.id).await.unwrap();

    assert!(store.discard_job(fresh.id).await.unwrap());
    assert!(matches!(
        store.get_job(fresh.id).await,
        Err(Error::JobNotFound(_))
    ));
    assert!(!store.discard_job(started.id).await.unwrap());
    assert_eq!(store.get_job(started.id).await.unwrap().processed, 1);
    assert!(!store.discard_job(JobId::new()).await.unwrap());

    // The key is free again.
    store
        .create_job(NewJob::new("fresh", 2).idempotency_key("week-1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn list_jobs_filters_stalled_processing_jobs() {
    let store = MemoryStore::new();
    let stalled = store.create_job(NewJob::new("stalled", 3)).await.unwrap();
    let finished = store.create_job(NewJob::new("finished", 1)).await.unwrap();
    store.increment(finished.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let cutoff = chrono::Utc::now();
    store.create_job(NewJob::new("fresh", 3)).await.unwrap();

    let processing = store
        .list_jobs(JobFilter {
            status: Some(JobStatus::Processing),
            created_before: Some(cutoff),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    let ids: Vec<_> = processing.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![stalled.id]);

    let all = store.list_jobs(JobFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].source_ref, "fresh", "newest first");

    let limited = store
        .list_jobs(JobFilter {
            limit: 1,
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[test]
fn job_status_round_trips_through_text() {
    assert_eq!("processing".parse::<JobStatus>().unwrap(), JobStatus::Processing);
    assert_eq!("completed".parse::<JobStatus>().unwrap(), JobStatus::Completed);
    assert!("done".parse::<JobStatus>().is_err());
    assert_eq!(format!("{:<10}|", JobStatus::Completed), "completed |");
}

#[test]
fn job_id_parses_full_uuid() {
    let id = JobId::new();
    let parsed: JobId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert_eq!(id.short().len(), 8);
    assert!("not-a-uuid".parse::<JobId>().is_err());
}
