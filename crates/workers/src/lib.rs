//! Bounded worker pool for asynchronous side effects.
//!
//! A fixed number of workers consume from a fixed-size queue. Submission
//! never blocks: when the queue is full the job is dropped and the caller
//! told so. Jobs receive the pool's shutdown token and are expected to
//! observe it; a panicking job is recovered without killing its worker.

pub mod push;

pub use push::{PushClient, PushNotification, PushNotifier};

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use wayfarer_common::{CoreError, Result, WorkerSettings};

type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

pub struct WorkerPool {
    queue_tx: RwLock<Option<mpsc::Sender<Job>>>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    pool_size: usize,
    started: AtomicBool,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    rejected: AtomicU64,
}

impl WorkerPool {
    pub fn new(settings: &WorkerSettings) -> Self {
        Self::with_sizes(settings.pool_size, settings.queue_size)
    }

    pub fn with_sizes(pool_size: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        Self {
            queue_tx: RwLock::new(Some(tx)),
            queue_rx: Arc::new(Mutex::new(rx)),
            workers: Mutex::new(Vec::new()),
            pool_size: pool_size.max(1),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
            rejected: AtomicU64::new(0),
        }
    }

    /// Spawn the workers. Idempotent; later calls are no-ops.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.pool_size {
            let queue_rx = self.queue_rx.clone();
            let cancel = self.cancel.clone();
            let active = self.active.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    // Hold the receiver lock only for the dequeue itself.
                    let job = { queue_rx.lock().await.recv().await };
                    let Some(job) = job else {
                        // Intake closed and queue drained.
                        break;
                    };

                    active.fetch_add(1, Ordering::SeqCst);
                    let outcome =
                        AssertUnwindSafe(job(cancel.clone())).catch_unwind().await;
                    active.fetch_sub(1, Ordering::SeqCst);

                    if outcome.is_err() {
                        error!(worker_id, "job panicked; worker continues");
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }
        info!(workers = self.pool_size, "worker pool started");
    }

    /// Enqueue a job. Returns `false` (job dropped) when the queue is full
    /// or the pool is shut down; never blocks the caller.
    pub async fn submit<F, Fut>(&self, job: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Job = Box::new(move |cancel| job(cancel).boxed());
        let queue_tx = self.queue_tx.read().await;
        let Some(tx) = queue_tx.as_ref() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match tx.try_send(boxed) {
            Ok(()) => true,
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Jobs currently executing. Never exceeds the pool size.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn rejected_jobs(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Stop intake, signal cancellation to running jobs, and wait for the
    /// workers to drain. Returns `Timeout` when they do not finish in time.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.cancel.cancel();
        *self.queue_tx.write().await = None;

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        if handles.is_empty() {
            return Ok(());
        }

        match timeout(deadline, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("worker pool drained");
                Ok(())
            }
            Err(_) => Err(CoreError::timeout(format!(
                "worker pool did not drain within {:?}",
                deadline
            ))),
        }
    }
}
