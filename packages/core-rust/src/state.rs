//! The capability a load-balancer state must offer to be persisted.
//!
//! The persistence layer never looks inside a state object. It asks the
//! object for its bytes through [`PersistentState::serialize_locked`], which
//! takes the state's own exclusive lock for the duration of serialization so
//! a concurrently running algorithm thread cannot mutate it mid-snapshot.

use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A state object that can be snapshotted to bytes and restored from them.
///
/// Used as `Arc<dyn PersistentState>`.
pub trait PersistentState: Send + Sync {
    /// Acquires the state's lock, serializes the state, and releases the lock.
    ///
    /// The lock must not be held once this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized.
    fn serialize_locked(&self) -> anyhow::Result<Vec<u8>>;

    /// Replaces the current state with one previously produced by
    /// [`serialize_locked`](Self::serialize_locked), under the same lock.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` cannot be decoded.
    fn restore(&self, bytes: &[u8]) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// LockedState
// ---------------------------------------------------------------------------

/// A serde-serializable value behind a mutex, encoded as `MessagePack`.
///
/// The owning algorithm mutates the value through [`lock()`](Self::lock);
/// the persistence layer snapshots it through [`PersistentState`].
#[derive(Debug, Default)]
pub struct LockedState<T> {
    inner: Mutex<T>,
}

impl<T> LockedState<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Locks the state for reading or mutation.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

impl<T> PersistentState for LockedState<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn serialize_locked(&self) -> anyhow::Result<Vec<u8>> {
        let guard = self.inner.lock();
        let bytes = rmp_serde::to_vec_named(&*guard)?;
        drop(guard);
        Ok(bytes)
    }

    fn restore(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let value: T = rmp_serde::from_slice(bytes)?;
        *self.inner.lock() = value;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RawState
// ---------------------------------------------------------------------------

/// A payload that is already in its serialized form.
///
/// Used by administrative tools that move bytes between backends, and by
/// tests that only care about the stored bytes.
#[derive(Debug, Default)]
pub struct RawState {
    bytes: Mutex<Vec<u8>>,
}

impl RawState {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Mutex::new(bytes.into()),
        }
    }

    /// Returns a copy of the current bytes.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl PersistentState for RawState {
    fn serialize_locked(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.bytes.lock().clone())
    }

    fn restore(&self, bytes: &[u8]) -> anyhow::Result<()> {
        *self.bytes.lock() = bytes.to_vec();
        Ok(())
    }
}
