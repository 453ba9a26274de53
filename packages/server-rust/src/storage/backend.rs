//! The contract every load-balancer state backend implements.
//!
//! Defines [`PersistenceBackend`], the abstraction over the file, database and
//! asynchronous coalescing implementations. All operations are scoped by a
//! `(channel, algorithm)` key; `delete` and `list` accept wildcard patterns.

use std::sync::Arc;

use async_trait::async_trait;
use lbstate_core::{KeyPattern, PersistenceKey, PersistentState};

use super::error::PersistenceError;

/// Durable storage for load-balancer states.
///
/// The four scopes of [`delete()`](PersistenceBackend::delete) and
/// [`list()`](PersistenceBackend::list) have identical semantics in every
/// implementation, so administrative tooling observes the same results
/// whichever backend is configured:
///
/// | pattern       | `delete`                              | `list` returns                        |
/// |---------------|---------------------------------------|---------------------------------------|
/// | `(*, *)`      | everything                            | all channel ids                       |
/// | `(c, *)`      | every algorithm of channel `c`        | algorithm ids stored under `c`        |
/// | `(*, a)`      | algorithm `a` in every channel        | channel ids that have `a`             |
/// | `(c, a)`      | the one record, no-op if absent       | `[a]` if the record exists, else `[]` |
///
/// Lists are sorted ascending.
///
/// Used as `Arc<dyn PersistenceBackend>`.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Loads the serialized state stored under `key`.
    ///
    /// Returns `None` if nothing is stored under the key.
    async fn load(&self, key: &PersistenceKey) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Serializes `state` under its own lock, then durably stores the bytes
    /// under `key`, replacing any previous record.
    ///
    /// Safe to call concurrently for different keys. Concurrent calls for the
    /// same key never corrupt the stored record.
    async fn store(
        &self,
        key: &PersistenceKey,
        state: Arc<dyn PersistentState>,
    ) -> Result<(), PersistenceError>;

    /// Deletes every record matching `pattern`.
    async fn delete(&self, pattern: &KeyPattern) -> Result<(), PersistenceError>;

    /// Lists the identifiers matching `pattern`, as described above.
    async fn list(&self, pattern: &KeyPattern) -> Result<Vec<String>, PersistenceError>;

    /// Waits until every accepted `store` is durable.
    ///
    /// Synchronous backends have nothing to wait for.
    async fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Releases resources (pools, background tasks). Pending writes are
    /// flushed first.
    async fn close(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Number of accepted but not yet dispatched `store` operations.
    fn pending_count(&self) -> usize {
        0
    }

    /// Whether this is the null (persistence disabled) implementation.
    fn is_null(&self) -> bool {
        false
    }
}

/// Serializes `state` into the payload to persist.
pub(crate) fn snapshot(state: &dyn PersistentState) -> Result<Vec<u8>, PersistenceError> {
    Ok(state.serialize_locked()?)
}
