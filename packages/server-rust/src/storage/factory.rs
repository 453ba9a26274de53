//! Registry resolving configuration strings into fully-wired backends.
//!
//! [`BackendRegistry`] is the dependency injection point for persistence: it
//! maps a configuration tag (`file`, `database`, `async`, ...) to a
//! [`BackendProvider`] that builds the backend from the remaining
//! whitespace-separated parameters. Providers that wrap another backend
//! (such as `async`) resolve their delegate through the same registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::DatasourceConfig;
use crate::storage::backend::PersistenceBackend;
use crate::storage::backends::FileBackend;
#[cfg(feature = "database")]
use crate::storage::backends::DatabaseBackend;
use crate::storage::coalescing::{AsyncParams, CoalescingBackend};
use crate::storage::error::ConfigurationError;

/// Builds one kind of backend from its configuration parameters.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    /// Creates the backend. `params` excludes the tag itself.
    async fn create(
        &self,
        params: &[String],
        registry: &BackendRegistry,
    ) -> Result<Arc<dyn PersistenceBackend>, ConfigurationError>;
}

// ---------------------------------------------------------------------------
// Built-in providers
// ---------------------------------------------------------------------------

/// `file [root]`
pub struct FileProvider;

#[async_trait]
impl BackendProvider for FileProvider {
    async fn create(
        &self,
        params: &[String],
        _registry: &BackendRegistry,
    ) -> Result<Arc<dyn PersistenceBackend>, ConfigurationError> {
        Ok(Arc::new(FileBackend::from_params(params)))
    }
}

/// `database [table_name [datasource_name]]`
#[cfg(feature = "database")]
pub struct DatabaseProvider;

#[cfg(feature = "database")]
#[async_trait]
impl BackendProvider for DatabaseProvider {
    async fn create(
        &self,
        params: &[String],
        registry: &BackendRegistry,
    ) -> Result<Arc<dyn PersistenceBackend>, ConfigurationError> {
        let backend = DatabaseBackend::from_params(params, registry.datasources()).await?;
        Ok(Arc::new(backend))
    }
}

/// `async [pool_size] <tag> [params...]`
pub struct AsyncProvider;

#[async_trait]
impl BackendProvider for AsyncProvider {
    async fn create(
        &self,
        params: &[String],
        registry: &BackendRegistry,
    ) -> Result<Arc<dyn PersistenceBackend>, ConfigurationError> {
        let parsed = AsyncParams::parse(params)?;
        let delegate = registry.create_from_tokens(parsed.delegate).await?;
        Ok(Arc::new(CoalescingBackend::new(delegate, parsed.pool_size)))
    }
}

// ---------------------------------------------------------------------------
// BackendRegistry
// ---------------------------------------------------------------------------

/// Tag-to-provider map plus the resources providers may need.
pub struct BackendRegistry {
    providers: HashMap<String, Arc<dyn BackendProvider>>,
    datasources: Vec<DatasourceConfig>,
}

impl BackendRegistry {
    /// A registry with the built-in providers.
    #[must_use]
    pub fn new(datasources: Vec<DatasourceConfig>) -> Self {
        let mut registry = Self::empty(datasources);
        registry.register("file", Arc::new(FileProvider));
        #[cfg(feature = "database")]
        {
            let database: Arc<dyn BackendProvider> = Arc::new(DatabaseProvider);
            registry.register("database", Arc::clone(&database));
            registry.register("db", database);
        }
        registry.register("async", Arc::new(AsyncProvider));
        registry
    }

    /// A registry with no providers.
    #[must_use]
    pub fn empty(datasources: Vec<DatasourceConfig>) -> Self {
        Self {
            providers: HashMap::new(),
            datasources,
        }
    }

    /// Registers `provider` under `tag` (case-insensitive), replacing any
    /// provider already registered under it.
    pub fn register(&mut self, tag: &str, provider: Arc<dyn BackendProvider>) {
        self.providers.insert(tag.to_ascii_lowercase(), provider);
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    #[must_use]
    pub fn datasources(&self) -> &[DatasourceConfig] {
        &self.datasources
    }

    /// Builds the backend described by a configuration string such as
    /// `"async 4 file /var/lib/lb"`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Empty`] for a blank string,
    /// [`ConfigurationError::UnknownBackend`] for an unregistered tag, or
    /// whatever the provider fails with.
    pub async fn create(
        &self,
        config: &str,
    ) -> Result<Arc<dyn PersistenceBackend>, ConfigurationError> {
        let tokens: Vec<String> = config.split_whitespace().map(str::to_string).collect();
        self.create_from_tokens(&tokens).await
    }

    /// Builds the backend described by already-split tokens: a tag followed
    /// by its parameters.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub async fn create_from_tokens(
        &self,
        tokens: &[String],
    ) -> Result<Arc<dyn PersistenceBackend>, ConfigurationError> {
        let (tag, params) = tokens.split_first().ok_or(ConfigurationError::Empty)?;
        let provider = self
            .providers
            .get(&tag.to_ascii_lowercase())
            .ok_or_else(|| ConfigurationError::UnknownBackend(tag.clone()))?;
        let backend = provider.create(params, self).await?;
        debug!(tag = %tag, backend = backend.name(), ?params, "persistence backend created");
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use lbstate_core::{KeyPattern, PersistenceKey, RawState};

    use super::*;
    use crate::storage::backends::NullBackend;

    struct NullProvider;

    #[async_trait]
    impl BackendProvider for NullProvider {
        async fn create(
            &self,
            _params: &[String],
            _registry: &BackendRegistry,
        ) -> Result<Arc<dyn PersistenceBackend>, ConfigurationError> {
            Ok(Arc::new(NullBackend))
        }
    }

    #[tokio::test]
    async fn blank_configuration_is_rejected() {
        let registry = BackendRegistry::default();
        assert!(matches!(registry.create("").await, Err(ConfigurationError::Empty)));
        assert!(matches!(registry.create("  \t ").await, Err(ConfigurationError::Empty)));
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let registry = BackendRegistry::default();
        match registry.create("redis localhost").await {
            Err(ConfigurationError::UnknownBackend(tag)) => assert_eq!(tag, "redis"),
            other => panic!("unexpected: {:?}", other.map(|b| b.name())),
        }
    }

    #[tokio::test]
    async fn creates_file_backend_with_root() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackendRegistry::default();
        let backend = registry
            .create(&format!("file {}", dir.path().display()))
            .await
            .unwrap();
        assert_eq!(backend.name(), "file");

        let key = PersistenceKey::new("c1", "a1").unwrap();
        backend
            .store(&key, Arc::new(RawState::new(b"state".to_vec())))
            .await
            .unwrap();
        assert!(dir.path().join("c1").join("a1.data").exists());
    }

    #[tokio::test]
    async fn tags_are_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackendRegistry::default();
        let backend = registry
            .create(&format!("FILE {}", dir.path().display()))
            .await
            .unwrap();
        assert_eq!(backend.name(), "file");
    }

    #[tokio::test]
    async fn async_wraps_the_named_backend() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackendRegistry::default();
        let backend = registry
            .create(&format!("async 3 file {}", dir.path().display()))
            .await
            .unwrap();
        assert_eq!(backend.name(), "async");

        let key = PersistenceKey::new("c1", "a1").unwrap();
        backend
            .store(&key, Arc::new(RawState::new(b"v".to_vec())))
            .await
            .unwrap();
        backend.flush().await.unwrap();
        assert_eq!(backend.list(&KeyPattern::all()).await.unwrap(), vec!["c1"]);
        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn async_without_delegate_is_rejected() {
        let registry = BackendRegistry::default();
        assert!(matches!(
            registry.create("async 2").await,
            Err(ConfigurationError::MissingParameter(_))
        ));
        assert!(matches!(
            registry.create("async 2 nosuch").await,
            Err(ConfigurationError::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn custom_providers_can_be_registered() {
        let mut registry = BackendRegistry::empty(Vec::new());
        assert!(registry.tags().is_empty());
        registry.register("Null", Arc::new(NullProvider));
        assert_eq!(registry.tags(), vec!["null"]);
        assert!(registry.create("null").await.unwrap().is_null());
    }

    #[test]
    fn builtin_tags() {
        let registry = BackendRegistry::default();
        let tags = registry.tags();
        assert!(tags.contains(&"file"));
        assert!(tags.contains(&"async"));
        #[cfg(feature = "database")]
        {
            assert!(tags.contains(&"database"));
            assert!(tags.contains(&"db"));
        }
    }

    #[cfg(feature = "database")]
    #[tokio::test]
    async fn database_requires_a_known_datasource() {
        let registry = BackendRegistry::default();
        match registry.create("database lb_state missingDS").await {
            Err(ConfigurationError::UnknownDatasource(name)) => assert_eq!(name, "missingDS"),
            other => panic!("unexpected: {:?}", other.map(|b| b.name())),
        }
    }

    #[cfg(feature = "database")]
    #[tokio::test]
    async fn database_resolves_datasource_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackendRegistry::new(vec![DatasourceConfig {
            name: "lbDS".to_string(),
            url: format!("sqlite://{}/lb.db?mode=rwc", dir.path().display()),
            max_connections: 2,
        }]);
        let backend = registry.create("db lb_state lbDS").await.unwrap();
        assert_eq!(backend.name(), "database");
        backend.close().await.unwrap();
    }
}
