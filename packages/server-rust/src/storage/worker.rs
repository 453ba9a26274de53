//! Bounded pool of background workers for persistence jobs.
//!
//! A fixed number of tokio tasks consume jobs from one shared bounded mpsc
//! queue, in submission order. Jobs are either fire-and-forget
//! ([`execute`](WorkerPool::execute)) or awaited by the caller through a
//! oneshot channel ([`submit`](WorkerPool::submit)).

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, trace};

use super::error::PersistenceError;

/// Default capacity of the job queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Largest number of workers a pool starts. All workers are spawned up
/// front, so the size is bounded.
pub const MAX_POOL_SIZE: usize = 256;

/// A unit of work run by the pool.
pub type Job = BoxFuture<'static, ()>;

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// Fixed-size pool of workers sharing one FIFO job queue.
///
/// Must be started from within a tokio runtime. Dropping the pool closes the
/// queue; workers exit once the jobs already queued have run.
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Starts `size` workers, clamped to `1..=MAX_POOL_SIZE`, over a queue of
    /// `queue_capacity` jobs.
    #[must_use]
    pub fn start(size: usize, queue_capacity: usize) -> Self {
        let size = size.clamp(1, MAX_POOL_SIZE);
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..size)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // Only the receive is under the lock; jobs run concurrently.
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            break; // Queue closed and drained.
                        };
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!(worker, "persistence job panicked");
                        }
                    }
                    trace!(worker, "persistence worker stopped");
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            size,
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues a job without waiting for it to run.
    ///
    /// Waits only if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::WorkerUnavailable`] if the pool was shut down.
    pub async fn execute(&self, job: Job) -> Result<(), PersistenceError> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or(PersistenceError::WorkerUnavailable)?;
        tx.send(job)
            .await
            .map_err(|_| PersistenceError::WorkerUnavailable)
    }

    /// Queues `task` and waits for its output.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::WorkerUnavailable`] if the pool was shut
    /// down, or the task panicked before producing a result.
    pub async fn submit<F, T>(&self, task: F) -> Result<T, PersistenceError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.execute(Box::pin(async move {
            // The caller may have given up waiting.
            let _ = result_tx.send(task.await);
        }))
        .await?;
        result_rx
            .await
            .map_err(|_| PersistenceError::WorkerUnavailable)
    }

    /// Closes the queue and waits for the workers to finish the queued jobs.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
