//! Claiming ready jobs: exclusivity, ordering and queue selection.

use std::collections::HashSet;
use std::sync::Arc;

use keel_core::db::{MemoryStore, SharedStore};
use keel_core::jobs::{ClaimCoordinator, JobId, JobQueue, NewJob, Placement, QueueSelector};

// ============================================================================
// Test Utilities
// ============================================================================

fn setup() -> (SharedStore, JobQueue, ClaimCoordinator) {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let claims = ClaimCoordinator::new(store.clone());
    (store, queue, claims)
}

async fn enqueue(queue: &JobQueue, queue_name: &str, priority: i32) -> JobId {
    queue
        .enqueue(
            NewJob::new("ReportJob")
                .on_queue(queue_name)
                .with_priority(priority),
        )
        .await
        .unwrap()
        .id
}

// ============================================================================
// Exclusivity
// ============================================================================

#[tokio::test]
async fn test_concurrent_claims_never_share_jobs() {
    let (_store, queue, claims) = setup();
    for _ in 0..60 {
        enqueue(&queue, "default", 0).await;
    }

    let mut tasks = Vec::new();
    for worker in 0..6 {
        let claims = claims.clone();
        tasks.push(tokio::spawn(async move {
            let selector = QueueSelector::all();
            let process_id = format!("worker-{}", worker);
            let mut mine = Vec::new();
            loop {
                let batch = claims.claim(&selector, 7, &process_id).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|c| c.job_id));
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for task in tasks {
        for job_id in task.await.unwrap() {
            assert!(seen.insert(job_id), "job {} claimed twice", job_id);
            total += 1;
        }
    }
    assert_eq!(total, 60);
}

#[tokio::test]
async fn test_claimed_job_has_exactly_one_placement() {
    let (_store, queue, claims) = setup();
    let job_id = enqueue(&queue, "default", 0).await;
    assert_eq!(queue.placements_of(job_id).await.unwrap(), vec![Placement::Ready]);

    let claimed = claims.claim(&QueueSelector::all(), 1, "worker-1").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].process_id, "worker-1");
    assert_eq!(queue.placements_of(job_id).await.unwrap(), vec![Placement::Claimed]);

    queue.finish(&claimed[0]).await.unwrap();
    assert_eq!(queue.placements_of(job_id).await.unwrap(), vec![Placement::Finished]);
}

#[tokio::test]
async fn test_claim_one() {
    let (_store, queue, claims) = setup();
    let job_id = enqueue(&queue, "default", 0).await;

    let first = claims.claim_one(job_id, "worker-1").await.unwrap();
    assert_eq!(first.map(|c| c.job_id), Some(job_id));

    let second = claims.claim_one(job_id, "worker-2").await.unwrap();
    assert!(second.is_none());
}

// ============================================================================
// Ordering and Limits
// ============================================================================

#[tokio::test]
async fn test_claim_orders_by_priority_then_id() {
    let (_store, queue, claims) = setup();
    let low = enqueue(&queue, "default", 5).await;
    let first_high = enqueue(&queue, "default", 0).await;
    let mid = enqueue(&queue, "default", 1).await;
    let second_high = enqueue(&queue, "default", 0).await;

    let claimed = claims.claim(&QueueSelector::all(), 3, "worker-1").await.unwrap();
    let ids: Vec<JobId> = claimed.iter().map(|c| c.job_id).collect();
    assert_eq!(ids, vec![first_high, second_high, mid]);

    let rest = claims.claim(&QueueSelector::all(), 3, "worker-1").await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].job_id, low);
}

#[tokio::test]
async fn test_claim_with_zero_limit_returns_nothing() {
    let (_store, queue, claims) = setup();
    let job_id = enqueue(&queue, "default", 0).await;

    let claimed = claims.claim(&QueueSelector::all(), 0, "worker-1").await.unwrap();
    assert!(claimed.is_empty());
    assert_eq!(queue.placement_of(job_id).await.unwrap(), Some(Placement::Ready));
}

#[tokio::test]
async fn test_claim_on_empty_ledger() {
    let (_store, _queue, claims) = setup();
    let claimed = claims.claim(&QueueSelector::all(), 10, "worker-1").await.unwrap();
    assert!(claimed.is_empty());
}

// ============================================================================
// Queue Selection
// ============================================================================

#[tokio::test]
async fn test_paused_queue_is_excluded() {
    let (_store, queue, claims) = setup();
    let paused = enqueue(&queue, "mailers", 0).await;
    let open = enqueue(&queue, "default", 5).await;

    queue.pause("mailers").await.unwrap();
    let claimed = claims.claim(&QueueSelector::all(), 10, "worker-1").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job_id, open);

    let named = claims
        .claim(&QueueSelector::parse("mailers"), 10, "worker-1")
        .await
        .unwrap();
    assert!(named.is_empty());

    queue.resume("mailers").await.unwrap();
    let claimed = claims.claim(&QueueSelector::all(), 10, "worker-1").await.unwrap();
    assert_eq!(claimed[0].job_id, paused);
}

#[tokio::test]
async fn test_ordered_queues_are_claimed_in_configured_order() {
    let (_store, queue, claims) = setup();
    let default_job = enqueue(&queue, "default", 0).await;
    let critical_a = enqueue(&queue, "critical", 9).await;
    let critical_b = enqueue(&queue, "critical", 9).await;

    let claimed = claims
        .claim(&QueueSelector::parse("critical,default"), 2, "worker-1")
        .await
        .unwrap();
    let ids: Vec<JobId> = claimed.iter().map(|c| c.job_id).collect();
    assert_eq!(ids, vec![critical_a, critical_b]);

    let claimed = claims
        .claim(&QueueSelector::parse("critical,default"), 2, "worker-1")
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job_id, default_job);
}

#[tokio::test]
async fn test_prefix_wildcard_expands_in_lexical_order() {
    let (_store, queue, claims) = setup();
    enqueue(&queue, "default", 0).await;
    let weekly = enqueue(&queue, "reports_weekly", 0).await;
    let daily = enqueue(&queue, "reports_daily", 0).await;

    let claimed = claims
        .claim(&QueueSelector::parse("reports*"), 10, "worker-1")
        .await
        .unwrap();
    let ids: Vec<JobId> = claimed.iter().map(|c| c.job_id).collect();
    assert_eq!(ids, vec![daily, weekly]);
}

#[tokio::test]
async fn test_release_claimed_returns_jobs_to_ready() {
    let (_store, queue, claims) = setup();
    let a = enqueue(&queue, "default", 0).await;
    let b = enqueue(&queue, "default", 0).await;
    let other = enqueue(&queue, "default", 0).await;

    claims.claim(&QueueSelector::all(), 2, "worker-1").await.unwrap();
    claims.claim(&QueueSelector::all(), 1, "worker-2").await.unwrap();

    let mut released = queue.release_claimed("worker-1").await.unwrap();
    released.sort();
    assert_eq!(released, vec![a, b]);
    assert_eq!(queue.placement_of(a).await.unwrap(), Some(Placement::Ready));
    assert_eq!(queue.placement_of(other).await.unwrap(), Some(Placement::Claimed));
}
