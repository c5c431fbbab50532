//! Worker pool invariants: concurrency bound, overflow refusal, shutdown
//! semantics, panic isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wayfarer_workers::WorkerPool;

#[tokio::test]
async fn concurrency_never_exceeds_pool_size() {
    let pool = Arc::new(WorkerPool::with_sizes(2, 16));
    pool.start().await;

    let current = Arc::new(AtomicUsize::new(0));
    let observed_max = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let current = current.clone();
        let observed_max = observed_max.clone();
        let completed = completed.clone();
        let accepted = pool
            .submit(move |_cancel| async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                observed_max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(accepted);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while completed.load(Ordering::SeqCst) < 8 {
        assert!(std::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(observed_max.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn overflow_is_refused_without_blocking() {
    let pool = Arc::new(WorkerPool::with_sizes(1, 2));
    pool.start().await;

    // Occupy the single worker until told otherwise.
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    assert!(
        pool.submit(move |_cancel| async move {
            let _ = release_rx.await;
        })
        .await
    );
    // Give the worker time to pick the blocker up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Two fit in the queue, further submissions are dropped immediately.
    assert!(pool.submit(|_cancel| async {}).await);
    assert!(pool.submit(|_cancel| async {}).await);

    let started = std::time::Instant::now();
    assert!(!pool.submit(|_cancel| async {}).await);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(pool.rejected_jobs(), 1);

    let _ = release_tx.send(());
}

#[tokio::test]
async fn cooperative_job_completes_before_shutdown_returns() {
    let pool = Arc::new(WorkerPool::with_sizes(1, 4));
    pool.start().await;

    let finished = Arc::new(AtomicUsize::new(0));
    let finished_clone = finished.clone();
    pool.submit(move |cancel| async move {
        // Well-behaved: wait for cancellation, then wrap up promptly.
        cancel.cancelled().await;
        finished_clone.fetch_add(1, Ordering::SeqCst);
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown(Duration::from_secs(2)).await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn uncooperative_job_times_out_shutdown() {
    let pool = Arc::new(WorkerPool::with_sizes(1, 4));
    pool.start().await;

    pool.submit(|_cancel| async {
        // Ignores cancellation entirely.
        tokio::time::sleep(Duration::from_secs(30)).await;
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = pool.shutdown(Duration::from_millis(100)).await.unwrap_err();
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn panicking_job_does_not_kill_its_worker() {
    let pool = Arc::new(WorkerPool::with_sizes(1, 4));
    pool.start().await;

    pool.submit(|_cancel| async {
        panic!("boom");
    })
    .await;

    let survived = Arc::new(AtomicUsize::new(0));
    let survived_clone = survived.clone();
    pool.submit(move |_cancel| async move {
        survived_clone.fetch_add(1, Ordering::SeqCst);
    })
    .await;

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while survived.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "worker died after panic");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn start_is_idempotent() {
    let pool = Arc::new(WorkerPool::with_sizes(2, 4));
    pool.start().await;
    pool.start().await;

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();
    pool.submit(move |_cancel| async move {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn submit_after_shutdown_is_refused() {
    let pool = Arc::new(WorkerPool::with_sizes(1, 4));
    pool.start().await;
    pool.shutdown(Duration::from_secs(1)).await.unwrap();
    assert!(!pool.submit(|_cancel| async {}).await);
}
