//! Concurrency keys: slot bounds, unblocking and semaphore expiry.

use std::sync::Arc;
use std::time::Duration;

use keel_core::db::{MemoryStore, RowLock, SharedStore};
use keel_core::jobs::{
    ClaimCoordinator, ConcurrencyLimit, JobError, JobId, JobQueue, NewJob, Placement,
    QueueSelector, SemaphoreManager,
};

// ============================================================================
// Test Utilities
// ============================================================================

struct Harness {
    store: SharedStore,
    queue: JobQueue,
    claims: ClaimCoordinator,
    semaphores: SemaphoreManager,
}

fn setup() -> Harness {
    let store: SharedStore = Arc::new(MemoryStore::new());
    Harness {
        queue: JobQueue::new(store.clone()),
        claims: ClaimCoordinator::new(store.clone()),
        semaphores: SemaphoreManager::new(store.clone()),
        store,
    }
}

async fn enqueue_limited(h: &Harness, limit: ConcurrencyLimit) -> JobId {
    h.queue
        .enqueue(NewJob::new("SyncJob").limited_by(limit))
        .await
        .unwrap()
        .id
}

async fn placement(h: &Harness, id: JobId) -> Placement {
    h.queue.placement_of(id).await.unwrap().unwrap()
}

// ============================================================================
// Slot Bound
// ============================================================================

#[tokio::test]
async fn test_limit_bounds_ready_jobs_per_key() {
    let h = setup();
    let limit = ConcurrencyLimit::new("account-1").with_limit(2);
    let a = enqueue_limited(&h, limit.clone()).await;
    let b = enqueue_limited(&h, limit.clone()).await;
    let c = enqueue_limited(&h, limit).await;
    let other = enqueue_limited(&h, ConcurrencyLimit::new("account-2")).await;

    assert_eq!(placement(&h, a).await, Placement::Ready);
    assert_eq!(placement(&h, b).await, Placement::Ready);
    assert_eq!(placement(&h, c).await, Placement::Blocked);
    assert_eq!(placement(&h, other).await, Placement::Ready);
}

#[tokio::test]
async fn test_finish_hands_the_slot_to_the_next_blocked_job() {
    let h = setup();
    let limit = ConcurrencyLimit::new("account-1");
    let first = enqueue_limited(&h, limit.clone()).await;
    let second = enqueue_limited(&h, limit.clone()).await;
    let third = enqueue_limited(&h, limit).await;
    assert_eq!(placement(&h, second).await, Placement::Blocked);

    let claimed = h.claims.claim(&QueueSelector::all(), 10, "worker-1").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job_id, first);

    h.queue.finish(&claimed[0]).await.unwrap();
    assert_eq!(placement(&h, first).await, Placement::Finished);
    assert_eq!(placement(&h, second).await, Placement::Ready);
    assert_eq!(placement(&h, third).await, Placement::Blocked);
}

#[tokio::test]
async fn test_failure_also_releases_the_slot() {
    let h = setup();
    let limit = ConcurrencyLimit::new("account-1");
    let first = enqueue_limited(&h, limit.clone()).await;
    let second = enqueue_limited(&h, limit).await;

    let claimed = h.claims.claim(&QueueSelector::all(), 1, "worker-1").await.unwrap();
    h.queue
        .fail(&claimed[0], &JobError::fatal("remote refused"))
        .await
        .unwrap();

    assert_eq!(placement(&h, first).await, Placement::Failed);
    assert_eq!(placement(&h, second).await, Placement::Ready);
}

#[tokio::test]
async fn test_finishing_twice_is_an_error() {
    let h = setup();
    enqueue_limited(&h, ConcurrencyLimit::new("account-1")).await;
    let claimed = h.claims.claim(&QueueSelector::all(), 1, "worker-1").await.unwrap();

    h.queue.finish(&claimed[0]).await.unwrap();
    let err = h.queue.finish(&claimed[0]).await.unwrap_err();
    assert_eq!(err.code(), keel_core::ErrorCode::RecordNotFound);
}

// ============================================================================
// Expiry
// ============================================================================

#[tokio::test]
async fn test_expired_semaphore_is_reclaimed_by_maintenance() {
    let h = setup();
    let limit = ConcurrencyLimit::new("account-1").with_duration_secs(0);
    let holder = enqueue_limited(&h, limit.clone()).await;
    let waiting = enqueue_limited(&h, limit).await;
    assert_eq!(placement(&h, waiting).await, Placement::Blocked);

    // The holder's worker never reports back.
    h.claims.claim(&QueueSelector::all(), 1, "crashed-worker").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.semaphores.expire_semaphores(100).await.unwrap(), 1);
    let released = h.semaphores.unblock(100).await.unwrap();
    assert_eq!(released, vec![waiting]);
    assert_eq!(placement(&h, waiting).await, Placement::Ready);
    assert_eq!(placement(&h, holder).await, Placement::Claimed);
}

#[tokio::test]
async fn test_unexpired_semaphores_are_kept() {
    let h = setup();
    let limit = ConcurrencyLimit::new("account-1");
    enqueue_limited(&h, limit.clone()).await;
    let waiting = enqueue_limited(&h, limit).await;

    assert_eq!(h.semaphores.expire_semaphores(100).await.unwrap(), 0);
    assert!(h.semaphores.unblock(100).await.unwrap().is_empty());
    assert_eq!(placement(&h, waiting).await, Placement::Blocked);
}

// ============================================================================
// Contention
// ============================================================================

#[tokio::test]
async fn test_unblock_skips_rows_held_by_another_transaction() {
    let h = setup();
    let limit = ConcurrencyLimit::new("account-1");
    enqueue_limited(&h, limit.clone()).await;
    let waiting = enqueue_limited(&h, limit).await;

    let claimed = h.claims.claim(&QueueSelector::all(), 1, "worker-1").await.unwrap();

    // Another maintenance cycle is moving the blocked row.
    let mut other = h.store.begin().await.unwrap();
    let held = other
        .select_blocked("account-1", 1, RowLock::NoWait)
        .await
        .unwrap();
    assert_eq!(held, vec![waiting]);

    h.queue.finish(&claimed[0]).await.unwrap();
    assert_eq!(placement(&h, waiting).await, Placement::Blocked);
    assert_eq!(
        h.semaphores.release_next_blocked("account-1").await.unwrap(),
        None
    );

    other.rollback().await.unwrap();
    assert_eq!(h.semaphores.unblock(10).await.unwrap(), vec![waiting]);
    assert_eq!(placement(&h, waiting).await, Placement::Ready);
}
