//! Error taxonomy for the persistence layer.
//!
//! [`ConfigurationError`] is raised while building a backend and is fatal to
//! persistence only. [`PersistenceError`] is raised by backend operations and
//! wraps the underlying I/O, SQL, or serialization cause.

use std::path::PathBuf;

use lbstate_core::InvalidId;

/// Failure of a `load`, `store`, `delete` or `list` operation.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state serialization failed: {0}")]
    State(#[from] anyhow::Error),
    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    InvalidKey(#[from] InvalidId),
    #[error("persistence worker pool is not running")]
    WorkerUnavailable,
    #[error(transparent)]
    Configuration(#[from] Box<ConfigurationError>),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<ConfigurationError> for PersistenceError {
    fn from(err: ConfigurationError) -> Self {
        Self::Configuration(Box::new(err))
    }
}

/// Failure to build or enable a persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("empty persistence configuration")]
    Empty,
    #[error("unknown persistence backend: {0}")]
    UnknownBackend(String),
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid value {value:?} for parameter {name}")]
    InvalidParameter { name: &'static str, value: String },
    #[error("no datasource named {0:?} is configured")]
    UnknownDatasource(String),
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("persistence is not enabled")]
    Disabled,
    #[error("could not initialize backend: {0}")]
    Backend(#[source] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mentions_path() {
        let err = PersistenceError::io(
            "/tmp/x/a.data",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/x/a.data"), "{msg}");
        assert!(msg.contains("denied"), "{msg}");
    }

    #[test]
    fn configuration_error_converts_to_persistence_error() {
        let err: PersistenceError = ConfigurationError::Disabled.into();
        assert!(matches!(err, PersistenceError::Configuration(_)));
        assert_eq!(err.to_string(), "persistence is not enabled");
    }

    #[test]
    fn invalid_key_is_transparent() {
        let id_err = lbstate_core::validate_id("a/b").unwrap_err();
        let err: PersistenceError = id_err.into();
        assert!(err.to_string().starts_with("invalid identifier"));
    }
}
