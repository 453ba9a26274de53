//! Asynchronous write-coalescing wrapper around another backend.
//!
//! [`CoalescingBackend`] accepts `store` calls without blocking. Each call
//! replaces whatever was still pending for the same key, so at most one
//! pending write exists per key and only the newest state is ever written.
//! A drain task hands pending writes to a bounded [`WorkerPool`]; a key with a
//! write in flight is not dispatched again until that write completes, which
//! keeps writes for one key ordered for any pool size.
//!
//! `load`, `delete` and `list` run on the same pool and are awaited. They are
//! not ordered against pending stores: a `delete` issued while a store for the
//! same key is still pending may be followed by that store.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use lbstate_core::{KeyPattern, PersistenceKey, PersistentState};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::backend::PersistenceBackend;
use super::error::{ConfigurationError, PersistenceError};
use super::worker::{WorkerPool, DEFAULT_QUEUE_CAPACITY, MAX_POOL_SIZE};

/// How often the drain task re-checks for pending writes when not woken.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pool size used when the configuration does not give one.
pub const DEFAULT_POOL_SIZE: usize = 1;

type KeyId = (String, String);

// ---------------------------------------------------------------------------
// Configuration parameters
// ---------------------------------------------------------------------------

/// Parsed parameters `[pool_size] <backend tag> [backend params...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncParams<'a> {
    /// Number of workers, between 1 and [`MAX_POOL_SIZE`].
    pub pool_size: usize,
    /// The wrapped backend's configuration: its tag followed by its parameters.
    pub delegate: &'a [String],
}

impl<'a> AsyncParams<'a> {
    /// Parses the parameters of the `async` backend.
    ///
    /// A leading integer is the pool size, raised to 1 if smaller; anything
    /// else is taken as the wrapped backend's tag.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidParameter`] for a pool size above
    /// [`MAX_POOL_SIZE`], or [`ConfigurationError::MissingParameter`] if no
    /// wrapped backend is named.
    pub fn parse(params: &'a [String]) -> Result<Self, ConfigurationError> {
        let (pool_size, delegate) = match params.split_first() {
            Some((first, rest)) => match first.parse::<i64>() {
                Ok(n) => {
                    let size = usize::try_from(n.max(1)).unwrap_or(usize::MAX);
                    if size > MAX_POOL_SIZE {
                        return Err(ConfigurationError::InvalidParameter {
                            name: "pool_size",
                            value: first.clone(),
                        });
                    }
                    (size, rest)
                }
                Err(_) => (DEFAULT_POOL_SIZE, params),
            },
            None => (DEFAULT_POOL_SIZE, params),
        };
        if delegate.is_empty() {
            return Err(ConfigurationError::MissingParameter("wrapped backend"));
        }
        Ok(Self {
            pool_size,
            delegate,
        })
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct PendingStore {
    key: PersistenceKey,
    state: Arc<dyn PersistentState>,
}

#[derive(Default)]
struct Pending {
    /// Newest not-yet-dispatched state per key.
    entries: HashMap<KeyId, PendingStore>,
    /// Keys with a write currently running on the pool.
    writing: HashSet<KeyId>,
}

impl Pending {
    fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.writing.is_empty()
    }
}

struct Shared {
    delegate: Arc<dyn PersistenceBackend>,
    pool: WorkerPool,
    pending: Mutex<Pending>,
    /// Wakes the drain task.
    wake: Notify,
    /// Signalled whenever a write completes.
    progress: Notify,
    poll_interval: Duration,
}

impl Shared {
    /// Moves every pending entry whose key has no write in flight into the
    /// returned batch, marking those keys as in flight.
    fn take_dispatchable(&self) -> Vec<(KeyId, PendingStore)> {
        let mut guard = self.pending.lock();
        let Pending { entries, writing } = &mut *guard;
        let ready: Vec<KeyId> = entries
            .keys()
            .filter(|id| !writing.contains(*id))
            .cloned()
            .collect();
        ready
            .into_iter()
            .filter_map(|id| {
                let entry = entries.remove(&id)?;
                writing.insert(id.clone());
                Some((id, entry))
            })
            .collect()
    }

    async fn dispatch(self: &Arc<Self>, id: KeyId, entry: PendingStore) {
        let shared = Arc::clone(self);
        // Clears the in-flight mark however the job ends: completed, panicked,
        // or dropped unrun by a stopped pool.
        let in_flight = InFlight {
            shared: Arc::clone(self),
            id: id.clone(),
        };
        let job = Box::pin(async move {
            // A newer state may have been accepted since this one was taken;
            // write that instead so it is not written a second time.
            let newer = shared.pending.lock().entries.remove(&in_flight.id);
            let entry = newer.unwrap_or(entry);
            let write = AssertUnwindSafe(shared.delegate.store(&entry.key, entry.state));
            match write.catch_unwind().await {
                Ok(Ok(())) => trace!(key = %entry.key, "asynchronous store completed"),
                Ok(Err(e)) => error!(
                    key = %entry.key,
                    backend = shared.delegate.name(),
                    error = %e,
                    "asynchronous store failed"
                ),
                Err(_) => error!(
                    key = %entry.key,
                    backend = shared.delegate.name(),
                    "asynchronous store panicked"
                ),
            }
            drop(in_flight);
        });

        if let Err(e) = self.pool.execute(job).await {
            error!(channel = %id.0, algorithm = %id.1, error = %e, "dropping pending store");
        }
    }

    fn finish_write(&self, id: &KeyId) {
        let more = {
            let mut pending = self.pending.lock();
            pending.writing.remove(id);
            pending.entries.contains_key(id)
        };
        if more {
            self.wake.notify_one();
        }
        self.progress.notify_waiters();
    }

    fn is_idle(&self) -> bool {
        self.pending.lock().is_idle()
    }
}

/// Marks one key as having a write in flight until dropped.
struct InFlight {
    shared: Arc<Shared>,
    id: KeyId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.finish_write(&self.id);
    }
}

async fn drain_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let batch = shared.take_dispatchable();
        if batch.is_empty() {
            tokio::select! {
                () = shared.wake.notified() => {}
                () = tokio::time::sleep(shared.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
            continue;
        }
        debug!(count = batch.len(), "dispatching pending stores");
        for (id, entry) in batch {
            shared.dispatch(id, entry).await;
        }
    }
    trace!("drain task stopped");
}

// ---------------------------------------------------------------------------
// CoalescingBackend
// ---------------------------------------------------------------------------

/// Non-blocking, latest-write-wins wrapper around another backend.
///
/// Must be created from within a tokio runtime.
pub struct CoalescingBackend {
    shared: Arc<Shared>,
    drain: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl CoalescingBackend {
    /// Wraps `delegate` with a pool of `pool_size` workers (at least one).
    #[must_use]
    pub fn new(delegate: Arc<dyn PersistenceBackend>, pool_size: usize) -> Self {
        Self::with_poll_interval(delegate, pool_size, DEFAULT_POLL_INTERVAL)
    }

    /// Like [`new`](Self::new) with a custom drain poll interval.
    #[must_use]
    pub fn with_poll_interval(
        delegate: Arc<dyn PersistenceBackend>,
        pool_size: usize,
        poll_interval: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            delegate,
            pool: WorkerPool::start(pool_size, DEFAULT_QUEUE_CAPACITY),
            pending: Mutex::new(Pending::default()),
            wake: Notify::new(),
            progress: Notify::new(),
            poll_interval,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let drain = tokio::spawn(drain_loop(Arc::clone(&shared), shutdown_rx));
        debug!(
            delegate = shared.delegate.name(),
            pool_size = shared.pool.size(),
            "asynchronous persistence started"
        );
        Self {
            shared,
            drain: Mutex::new(Some(drain)),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.shared.pool.size()
    }

    /// The wrapped backend.
    #[must_use]
    pub fn delegate(&self) -> &Arc<dyn PersistenceBackend> {
        &self.shared.delegate
    }
}

#[async_trait]
impl PersistenceBackend for CoalescingBackend {
    fn name(&self) -> &'static str {
        "async"
    }

    async fn load(&self, key: &PersistenceKey) -> Result<Option<Vec<u8>>, PersistenceError> {
        let delegate = Arc::clone(&self.shared.delegate);
        let key = key.clone();
        self.shared
            .pool
            .submit(async move { delegate.load(&key).await })
            .await?
    }

    /// Accepts the store and returns immediately. Failures of the eventual
    /// write are logged and never reported to the caller.
    async fn store(
        &self,
        key: &PersistenceKey,
        state: Arc<dyn PersistentState>,
    ) -> Result<(), PersistenceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistenceError::WorkerUnavailable);
        }
        let replaced = self
            .shared
            .pending
            .lock()
            .entries
            .insert(
                key.id_pair(),
                PendingStore {
                    key: key.clone(),
                    state,
                },
            )
            .is_some();
        if replaced {
            trace!(%key, "coalesced pending store");
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    async fn delete(&self, pattern: &KeyPattern) -> Result<(), PersistenceError> {
        let delegate = Arc::clone(&self.shared.delegate);
        let pattern = pattern.clone();
        self.shared
            .pool
            .submit(async move { delegate.delete(&pattern).await })
            .await?
    }

    async fn list(&self, pattern: &KeyPattern) -> Result<Vec<String>, PersistenceError> {
        let delegate = Arc::clone(&self.shared.delegate);
        let pattern = pattern.clone();
        self.shared
            .pool
            .submit(async move { delegate.list(&pattern).await })
            .await?
    }

    /// Waits until no store is pending or in flight.
    async fn flush(&self) -> Result<(), PersistenceError> {
        loop {
            let progress = self.shared.progress.notified();
            tokio::pin!(progress);
            progress.as_mut().enable();
            if self.shared.is_idle() {
                return Ok(());
            }
            let drain_stopped = self
                .drain
                .lock()
                .as_ref()
                .map_or(true, JoinHandle::is_finished);
            if drain_stopped {
                // Nothing will drain what is left.
                return Err(PersistenceError::WorkerUnavailable);
            }
            self.shared.wake.notify_one();
            tokio::select! {
                () = &mut progress => {}
                () = tokio::time::sleep(self.shared.poll_interval) => {}
            }
        }
    }

    async fn close(&self) -> Result<(), PersistenceError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.flush().await;

        // The drain task may already be gone, in which case nobody listens.
        let _ = self.shutdown.send(true);
        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            if let Err(e) = drain.await {
                error!(error = %e, "drain task failed");
            }
        }
        self.shared.pool.shutdown().await;
        debug!(delegate = self.shared.delegate.name(), "asynchronous persistence stopped");

        flushed?;
        self.shared.delegate.close().await
    }

    fn pending_count(&self) -> usize {
        self.shared.pending.lock().entries.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
