use std::sync::Arc;

use crate::state::PersistentState;

/// A load-balancer instance ("bundler") attached to one channel.
///
/// The algorithms themselves live outside this crate. Persistence only needs
/// the algorithm's clear-text name and, when the algorithm supports it, a
/// handle to its persistable state.
pub trait Bundler: Send + Sync {
    /// Clear-text name of the load-balancing algorithm (e.g. `"proportional"`).
    fn algorithm(&self) -> &str;

    /// The state to persist and restore, or `None` if this algorithm keeps
    /// no state worth persisting.
    fn persistent_state(&self) -> Option<Arc<dyn PersistentState>> {
        None
    }
}
