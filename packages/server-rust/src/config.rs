//! Persistence settings.
//!
//! Settings come from a JSON document (or are built in code for tests). The
//! `persistence` entry is the backend configuration string, for example:
//!
//! ```text
//! file /var/lib/grid/lb_persistence
//! database load_balancer loadBalancerDS
//! async 4 database load_balancer loadBalancerDS
//! ```
//!
//! Datasources referenced by the database backend are declared by name.

use std::path::Path;

use lbstate_core::HashFunction;
use serde::Deserialize;

use crate::storage::error::ConfigurationError;

/// Default size of a datasource connection pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

/// A named database connection pool definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasourceConfig {
    /// Name referenced by the database backend parameters.
    pub name: String,
    /// Connection URL (`postgres://...` or `sqlite://...`).
    pub url: String,
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Top-level persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Backend configuration string. `None` disables persistence.
    pub persistence: Option<String>,
    /// Hash function used to derive algorithm identifiers.
    pub hash: String,
    /// Named datasources available to the database backend.
    pub datasources: Vec<DatasourceConfig>,
    /// Algorithm names known up front, so listings can show clear-text names
    /// for records written by a previous run.
    pub algorithms: Vec<String>,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            persistence: None,
            hash: HashFunction::default().as_str().to_string(),
            datasources: Vec::new(),
            algorithms: Vec::new(),
        }
    }
}

impl PersistenceSettings {
    /// Settings with the given configuration string and defaults elsewhere.
    #[must_use]
    pub fn with_persistence(persistence: impl Into<String>) -> Self {
        Self {
            persistence: Some(persistence.into()),
            ..Self::default()
        }
    }

    /// Parses settings from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Settings`] if the document is malformed.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::Settings(e.to_string()))
    }

    /// Reads and parses a JSON settings file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Settings`] if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigurationError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::Settings(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// The configured hash function.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidParameter`] for an unknown name.
    pub fn hash_function(&self) -> Result<HashFunction, ConfigurationError> {
        self.hash
            .parse()
            .map_err(|_| ConfigurationError::InvalidParameter {
                name: "hash",
                value: self.hash.clone(),
            })
    }

    /// Whether a non-blank backend configuration string is present.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.persistence
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
    }
}
