//! lbstate server — durable storage of adaptive load-balancer state in files
//! or a relational database, with an optional write-coalescing async wrapper.

pub mod config;
pub mod manager;
pub mod storage;

pub use config::{DatasourceConfig, PersistenceSettings};
pub use manager::PersistenceManager;
pub use storage::{
    BackendRegistry, ConfigurationError, PersistenceBackend, PersistenceError,
};
