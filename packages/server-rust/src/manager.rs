//! Facade between the grid and the configured persistence backend.
//!
//! [`PersistenceManager`] translates clear-text algorithm names to their
//! hashed identifiers before touching the backend, loads and restores state
//! when a bundler is attached to a channel, stores state when it changes,
//! and exposes the management operations used by administrative tooling.
//!
//! When persistence is not configured the manager wraps a
//! [`NullBackend`]: queries return empty results and mutations do nothing,
//! except [`delete`](PersistenceManager::delete), which fails.

use std::sync::Arc;

use dashmap::DashMap;
use lbstate_core::{Bundler, HashFunction, KeyPattern, PersistenceKey};
use tracing::{debug, info, warn};

use crate::config::PersistenceSettings;
use crate::storage::backends::NullBackend;
use crate::storage::{BackendRegistry, ConfigurationError, PersistenceBackend, PersistenceError};

/// Entry point for load-balancer state persistence.
///
/// Shared as `Arc<PersistenceManager>` by every channel.
pub struct PersistenceManager {
    backend: Arc<dyn PersistenceBackend>,
    hash: HashFunction,
    /// Algorithm identifier -> clear-text name.
    names: DashMap<String, String>,
}

impl PersistenceManager {
    #[must_use]
    pub fn new(backend: Arc<dyn PersistenceBackend>, hash: HashFunction) -> Self {
        Self {
            backend,
            hash,
            names: DashMap::new(),
        }
    }

    /// A manager with persistence disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullBackend), HashFunction::default())
    }

    /// Builds the manager described by `settings` with the built-in backends.
    ///
    /// A configuration failure disables persistence rather than failing: it
    /// is logged and a disabled manager is returned.
    pub async fn from_settings(settings: &PersistenceSettings) -> Self {
        let registry = BackendRegistry::new(settings.datasources.clone());
        match Self::try_from_settings(settings, &registry).await {
            Ok(manager) => manager,
            Err(e) => {
                warn!(error = %e, "load-balancer persistence disabled: invalid configuration");
                Self::disabled()
            }
        }
    }

    /// Builds the manager described by `settings`, resolving the backend
    /// through `registry`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the hash function is unknown or the
    /// backend cannot be built.
    pub async fn try_from_settings(
        settings: &PersistenceSettings,
        registry: &BackendRegistry,
    ) -> Result<Self, ConfigurationError> {
        let hash = settings.hash_function()?;
        let backend: Arc<dyn PersistenceBackend> = match settings.persistence.as_deref() {
            Some(config) if settings.is_enabled() => registry.create(config).await?,
            _ => Arc::new(NullBackend),
        };
        let manager = Self::new(backend, hash);
        manager.register_algorithms(settings.algorithms.as_slice());
        if manager.is_persistence_enabled() {
            info!(backend = manager.backend.name(), %hash, "load-balancer persistence enabled");
        } else {
            debug!("load-balancer persistence not configured");
        }
        Ok(manager)
    }

    #[must_use]
    pub fn is_persistence_enabled(&self) -> bool {
        !self.backend.is_null()
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    #[must_use]
    pub fn hash_function(&self) -> HashFunction {
        self.hash
    }

    // -----------------------------------------------------------------------
    // Name translation
    // -----------------------------------------------------------------------

    /// The storage identifier of an algorithm.
    #[must_use]
    pub fn algorithm_id(&self, name: &str) -> String {
        self.hash.digest(name)
    }

    /// Makes the names of algorithms known, so listings show them in clear
    /// text. Names seen through [`attach`](Self::attach) and
    /// [`state_changed`](Self::state_changed) are remembered as well; names
    /// passed to queries and deletions are not.
    pub fn register_algorithms<S: AsRef<str>>(&self, names: &[S]) {
        for name in names {
            self.remember(name.as_ref());
        }
    }

    fn remember(&self, name: &str) {
        self.names
            .entry(self.algorithm_id(name))
            .or_insert_with(|| name.to_string());
    }

    /// The clear-text name of a stored algorithm identifier, or the
    /// identifier itself if the name was never seen.
    #[must_use]
    pub fn algorithm_name(&self, id: &str) -> String {
        self.names
            .get(id)
            .map_or_else(|| id.to_string(), |name| name.value().clone())
    }

    fn key(&self, channel_id: &str, algorithm: &str) -> Result<PersistenceKey, PersistenceError> {
        Ok(PersistenceKey::new(channel_id, self.algorithm_id(algorithm))?
            .with_algorithm_label(algorithm))
    }

    // -----------------------------------------------------------------------
    // Bundler integration
    // -----------------------------------------------------------------------

    /// Restores the previously persisted state of `bundler` on `channel_id`.
    ///
    /// Returns `true` if a state was found and restored. Failures are logged
    /// and reported as `false`: the bundler then starts from scratch.
    pub async fn attach(&self, channel_id: &str, bundler: &dyn Bundler) -> bool {
        let Some(state) = bundler.persistent_state() else {
            return false;
        };
        self.remember(bundler.algorithm());
        let key = match self.key(channel_id, bundler.algorithm()) {
            Ok(key) => key,
            Err(e) => {
                warn!(channel_id, algorithm = bundler.algorithm(), error = %e, "cannot restore load-balancer state");
                return false;
            }
        };
        match self.backend.load(&key).await {
            Ok(Some(bytes)) => match state.restore(&bytes) {
                Ok(()) => {
                    debug!(%key, len = bytes.len(), "restored load-balancer state");
                    true
                }
                Err(e) => {
                    warn!(%key, error = %e, "discarding unreadable load-balancer state");
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                warn!(%key, error = %e, "failed to load load-balancer state");
                false
            }
        }
    }

    /// Stores the current state of `bundler` on `channel_id`. Failures are
    /// logged and otherwise ignored.
    pub async fn state_changed(&self, channel_id: &str, bundler: &dyn Bundler) {
        let Some(state) = bundler.persistent_state() else {
            return;
        };
        self.remember(bundler.algorithm());
        let result = match self.key(channel_id, bundler.algorithm()) {
            Ok(key) => self.backend.store(&key, state).await.map(|()| key),
            Err(e) => Err(e),
        };
        match result {
            Ok(key) => debug!(%key, "stored load-balancer state"),
            Err(e) => warn!(
                channel_id,
                algorithm = bundler.algorithm(),
                error = %e,
                "failed to store load-balancer state"
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Management operations
    // -----------------------------------------------------------------------

    /// Identifiers of every channel with at least one stored state.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the backend fails.
    pub async fn list_all_channels(&self) -> Result<Vec<String>, PersistenceError> {
        self.backend.list(&KeyPattern::all()).await
    }

    /// Names of the algorithms with a stored state on `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the channel identifier is invalid or
    /// the backend fails.
    pub async fn list_algorithms(&self, channel_id: &str) -> Result<Vec<String>, PersistenceError> {
        let ids = self.backend.list(&KeyPattern::channel(channel_id)?).await?;
        Ok(ids.iter().map(|id| self.algorithm_name(id)).collect())
    }

    /// Identifiers of the channels with a stored state for `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the backend fails.
    pub async fn list_all_channels_with_algorithm(
        &self,
        algorithm: &str,
    ) -> Result<Vec<String>, PersistenceError> {
        let pattern = KeyPattern::algorithm(self.algorithm_id(algorithm))?;
        self.backend.list(&pattern).await
    }

    /// Whether a state is stored for `algorithm` on `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the channel identifier is invalid or
    /// the backend fails.
    pub async fn has_algorithm(
        &self,
        channel_id: &str,
        algorithm: &str,
    ) -> Result<bool, PersistenceError> {
        let key = self.key(channel_id, algorithm)?;
        Ok(!self.backend.list(&KeyPattern::from(&key)).await?.is_empty())
    }

    /// Deletes every stored state.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the backend fails.
    pub async fn delete_all(&self) -> Result<(), PersistenceError> {
        self.backend.delete(&KeyPattern::all()).await
    }

    /// Deletes every state stored on `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the channel identifier is invalid or
    /// the backend fails.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<(), PersistenceError> {
        self.backend.delete(&KeyPattern::channel(channel_id)?).await
    }

    /// Deletes the states of `algorithm` on every channel.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the backend fails.
    pub async fn delete_algorithm(&self, algorithm: &str) -> Result<(), PersistenceError> {
        let pattern = KeyPattern::algorithm(self.algorithm_id(algorithm))?;
        self.backend.delete(&pattern).await
    }

    /// Deletes the state of `algorithm` on `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Disabled`] when persistence is not
    /// configured, or a [`PersistenceError`] if the backend fails.
    pub async fn delete(&self, channel_id: &str, algorithm: &str) -> Result<(), PersistenceError> {
        if !self.is_persistence_enabled() {
            return Err(ConfigurationError::Disabled.into());
        }
        let key = self.key(channel_id, algorithm)?;
        self.backend.delete(&KeyPattern::from(&key)).await
    }

    /// Waits until every accepted store is durable.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the backend cannot drain.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        self.backend.flush().await
    }

    /// Flushes and releases the backend.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the backend fails to close cleanly.
    pub async fn close(&self) -> Result<(), PersistenceError> {
        self.backend.close().await
    }
}

impl Default for PersistenceManager {
    fn default() -> Self {
        Self::disabled()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use lbstate_core::{LockedState, PersistentState};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::storage::backends::FileBackend;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Weights {
        per_node: Vec<(String, f64)>,
        samples: u64,
    }

    struct TestBundler {
        algorithm: String,
        state: Option<Arc<LockedState<Weights>>>,
    }

    impl TestBundler {
        fn stateful(algorithm: &str) -> Self {
            Self {
                algorithm: algorithm.to_string(),
                state: Some(Arc::new(LockedState::default())),
            }
        }

        fn stateless(algorithm: &str) -> Self {
            Self {
                algorithm: algorithm.to_string(),
                state: None,
            }
        }

        fn weights(&self) -> Weights {
            self.state.as_ref().map(|s| s.lock().clone()).unwrap_or_default()
        }
    }

    impl Bundler for TestBundler {
        fn algorithm(&self) -> &str {
            &self.algorithm
        }

        fn persistent_state(&self) -> Option<Arc<dyn PersistentState>> {
            self.state
                .clone()
                .map(|state| state as Arc<dyn PersistentState>)
        }
    }

    fn file_manager(dir: &std::path::Path) -> PersistenceManager {
        PersistenceManager::new(Arc::new(FileBackend::new(dir)), HashFunction::Sha256)
    }

    async fn store(manager: &PersistenceManager, channel: &str, algorithm: &str) {
        let bundler = TestBundler::stateful(algorithm);
        bundler.state.as_ref().unwrap().lock().samples = 1;
        manager.state_changed(channel, &bundler).await;
    }

    // -- disabled --

    #[tokio::test]
    async fn disabled_manager_is_inert() {
        let manager = PersistenceManager::disabled();
        assert!(!manager.is_persistence_enabled());

        store(&manager, "c1", "proportional").await;
        assert!(manager.list_all_channels().await.unwrap().is_empty());
        assert!(manager.list_algorithms("c1").await.unwrap().is_empty());
        assert!(manager
            .list_all_channels_with_algorithm("proportional")
            .await
            .unwrap()
            .is_empty());
        assert!(!manager.has_algorithm("c1", "proportional").await.unwrap());
        manager.delete_all().await.unwrap();
        manager.delete_channel("c1").await.unwrap();
        manager.delete_algorithm("proportional").await.unwrap();
        assert!(!manager.attach("c1", &TestBundler::stateful("proportional")).await);
    }

    #[tokio::test]
    async fn disabled_manager_rejects_single_delete() {
        let manager = PersistenceManager::disabled();
        let err = manager.delete("c1", "proportional").await.unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Configuration(ref e) if matches!(**e, ConfigurationError::Disabled)
        ));
    }

    #[tokio::test]
    async fn invalid_configuration_yields_disabled_manager() {
        let manager =
            PersistenceManager::from_settings(&PersistenceSettings::with_persistence("nosuch x"))
                .await;
        assert!(!manager.is_persistence_enabled());

        let settings = PersistenceSettings {
            hash: "md5".to_string(),
            ..PersistenceSettings::with_persistence("file")
        };
        assert!(!PersistenceManager::from_settings(&settings)
            .await
            .is_persistence_enabled());
    }

    #[tokio::test]
    async fn absent_configuration_yields_disabled_manager() {
        let manager = PersistenceManager::from_settings(&PersistenceSettings::default()).await;
        assert!(!manager.is_persistence_enabled());
        assert_eq!(manager.backend().name(), "null");
    }

    // -- name translation --

    #[test]
    fn algorithm_ids_are_hashed_names() {
        let manager = PersistenceManager::disabled();
        let id = manager.algorithm_id("proportional");
        assert_eq!(id, HashFunction::Sha256.digest("proportional"));
        assert_ne!(id, "proportional");
        assert_eq!(manager.algorithm_name(&id), id);

        manager.register_algorithms(&["proportional"]);
        assert_eq!(manager.algorithm_name(&id), "proportional");
        assert_eq!(manager.algorithm_name("deadbeef"), "deadbeef");
    }

    #[tokio::test]
    async fn queries_do_not_grow_the_name_registry() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path());
        store(&manager, "c1", "proportional").await;
        assert_eq!(manager.names.len(), 1);

        for i in 0..50 {
            let name = format!("adhoc-{i}");
            manager.list_all_channels_with_algorithm(&name).await.unwrap();
            manager.has_algorithm("c1", &name).await.unwrap();
            manager.delete_algorithm(&name).await.unwrap();
            manager.delete("c1", &name).await.unwrap();
        }
        assert_eq!(manager.names.len(), 1);
        assert_eq!(manager.list_algorithms("c1").await.unwrap(), vec!["proportional"]);

        let bundler = TestBundler::stateful("autotuned");
        assert!(!manager.attach("c1", &bundler).await);
        assert_eq!(manager.names.len(), 2);
    }

    #[tokio::test]
    async fn stored_algorithm_ids_are_opaque_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path());
        store(&manager, "c1", "proportional").await;

        let id = HashFunction::Sha256.digest("proportional");
        assert!(dir.path().join("c1").join(format!("{id}.data")).exists());
        assert_eq!(manager.list_algorithms("c1").await.unwrap(), vec!["proportional"]);
    }

    #[tokio::test]
    async fn listings_of_unknown_ids_become_readable_once_registered() {
        let dir = tempfile::tempdir().unwrap();
        store(&file_manager(dir.path()), "c1", "autotuned").await;

        // A fresh manager has never seen the name.
        let manager = file_manager(dir.path());
        let id = HashFunction::Sha256.digest("autotuned");
        assert_eq!(manager.list_algorithms("c1").await.unwrap(), vec![id]);

        manager.register_algorithms(&["autotuned", "proportional"]);
        assert_eq!(manager.list_algorithms("c1").await.unwrap(), vec!["autotuned"]);
    }

    // -- bundler integration --

    #[tokio::test]
    async fn attach_restores_stored_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path());

        let first = TestBundler::stateful("proportional");
        assert!(!manager.attach("c1", &first).await);
        {
            let mut weights = first.state.as_ref().unwrap().lock();
            weights.per_node.push(("node-1".to_string(), 0.75));
            weights.samples = 42;
        }
        manager.state_changed("c1", &first).await;

        let second = TestBundler::stateful("proportional");
        assert!(manager.attach("c1", &second).await);
        assert_eq!(second.weights(), first.weights());

        // Another channel has its own state.
        let other = TestBundler::stateful("proportional");
        assert!(!manager.attach("c2", &other).await);
        assert_eq!(other.weights(), Weights::default());
    }

    #[tokio::test]
    async fn stateless_bundlers_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path());
        let bundler = TestBundler::stateless("manual");

        manager.state_changed("c1", &bundler).await;
        assert!(!manager.attach("c1", &bundler).await);
        assert!(manager.list_all_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_state_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path());
        let id = manager.algorithm_id("proportional");
        std::fs::create_dir_all(dir.path().join("c1")).unwrap();
        std::fs::write(dir.path().join("c1").join(format!("{id}.data")), b"\xc1garbage").unwrap();

        let bundler = TestBundler::stateful("proportional");
        assert!(!manager.attach("c1", &bundler).await);
        assert_eq!(bundler.weights(), Weights::default());
    }

    #[tokio::test]
    async fn invalid_channel_id_is_logged_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path());
        let bundler = TestBundler::stateful("proportional");
        manager.state_changed("../escape", &bundler).await;
        assert!(!manager.attach("../escape", &bundler).await);
        assert!(manager.list_all_channels().await.unwrap().is_empty());
    }

    // -- management operations --

    #[tokio::test]
    async fn management_operations() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(dir.path());
        for channel in ["c1", "c2"] {
            for algorithm in ["proportional", "autotuned"] {
                store(&manager, channel, algorithm).await;
            }
        }
        store(&manager, "c3", "rl").await;

        assert_eq!(manager.list_all_channels().await.unwrap(), vec!["c1", "c2", "c3"]);
        let mut algorithms = manager.list_algorithms("c1").await.unwrap();
        algorithms.sort();
        assert_eq!(algorithms, vec!["autotuned", "proportional"]);
        assert_eq!(
            manager.list_all_channels_with_algorithm("autotuned").await.unwrap(),
            vec!["c1", "c2"]
        );
        assert!(manager.has_algorithm("c3", "rl").await.unwrap());
        assert!(!manager.has_algorithm("c3", "autotuned").await.unwrap());

        manager.delete("c1", "proportional").await.unwrap();
        assert_eq!(manager.list_algorithms("c1").await.unwrap(), vec!["autotuned"]);

        manager.delete_algorithm("autotuned").await.unwrap();
        assert_eq!(manager.list_all_channels().await.unwrap(), vec!["c2", "c3"]);

        manager.delete_channel("c2").await.unwrap();
        assert_eq!(manager.list_all_channels().await.unwrap(), vec!["c3"]);

        manager.delete_all().await.unwrap();
        assert!(manager.list_all_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn asynchronous_backend_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PersistenceSettings {
            hash: "blake3".to_string(),
            algorithms: vec!["proportional".to_string()],
            ..PersistenceSettings::with_persistence(format!(
                "async 2 file {}",
                dir.path().display()
            ))
        };
        let manager = PersistenceManager::from_settings(&settings).await;
        assert!(manager.is_persistence_enabled());
        assert_eq!(manager.backend().name(), "async");
        assert_eq!(manager.hash_function(), HashFunction::Blake3);

        store(&manager, "c1", "proportional").await;
        manager.flush().await.unwrap();
        assert_eq!(manager.list_algorithms("c1").await.unwrap(), vec!["proportional"]);

        let restored = TestBundler::stateful("proportional");
        assert!(manager.attach("c1", &restored).await);
        assert_eq!(restored.weights().samples, 1);
        manager.close().await.unwrap();
    }
}
