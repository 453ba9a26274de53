//! Load-balancer state persistence.
//!
//! - [`PersistenceBackend`]: the contract shared by every backend
//! - [`backends`]: file, database and null implementations
//! - [`CoalescingBackend`]: non-blocking, latest-write-wins wrapper running
//!   writes on a bounded [`WorkerPool`]
//! - [`BackendRegistry`]: builds a backend from a configuration string

pub mod backend;
pub mod backends;
pub mod coalescing;
pub mod error;
pub mod factory;
pub mod worker;

pub use backend::PersistenceBackend;
pub use coalescing::CoalescingBackend;
pub use error::{ConfigurationError, PersistenceError};
pub use factory::{BackendProvider, BackendRegistry};
pub use worker::WorkerPool;
