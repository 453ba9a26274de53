//! `lbstate` Core — persistence keys, wildcard scopes, the state capability, and identifier hashing.

pub mod hash;
pub mod state;
pub mod traits;
pub mod types;

pub use hash::HashFunction;
pub use state::{LockedState, PersistentState, RawState};
pub use traits::Bundler;
pub use types::{validate_id, InvalidId, KeyPattern, PersistenceKey, Scope, MAX_ID_LEN};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
