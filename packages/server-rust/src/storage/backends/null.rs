//! No-op [`PersistenceBackend`] implementation.
//!
//! [`NullBackend`] stands in when no persistence is configured (or the
//! configured backend failed to start). It discards writes and returns empty
//! results for reads, so the rest of the grid runs unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use lbstate_core::{KeyPattern, PersistenceKey, PersistentState};

use crate::storage::backend::PersistenceBackend;
use crate::storage::error::PersistenceError;

/// No-op backend used when persistence is disabled.
///
/// All mutations succeed without side effects. `load` always returns
/// not-found and `list` always returns an empty list.
pub struct NullBackend;

#[async_trait]
impl PersistenceBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn load(&self, _key: &PersistenceKey) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(None)
    }

    async fn store(
        &self,
        _key: &PersistenceKey,
        _state: Arc<dyn PersistentState>,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn delete(&self, _pattern: &KeyPattern) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn list(&self, _pattern: &KeyPattern) -> Result<Vec<String>, PersistenceError> {
        Ok(Vec::new())
    }

    fn is_null(&self) -> bool {
        true
    }
}
