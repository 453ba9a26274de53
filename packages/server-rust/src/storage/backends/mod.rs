//! Concrete [`PersistenceBackend`](crate::storage::PersistenceBackend) implementations.

#[cfg(feature = "database")]
pub mod database;
pub mod file;
pub mod null;

#[cfg(feature = "database")]
pub use database::{DatabaseBackend, Dialect};
pub use file::FileBackend;
pub use null::NullBackend;

#[cfg(all(test, feature = "database"))]
mod tests {
    use std::sync::Arc;

    use lbstate_core::{KeyPattern, PersistenceKey, RawState};

    use super::*;
    use crate::config::DatasourceConfig;
    use crate::storage::backend::PersistenceBackend;

    const CHANNELS: [&str; 3] = ["c1", "c2", "c3"];
    const ALGORITHMS: [&str; 3] = ["a1", "a2", "a3"];

    /// A sparse grid: c1 has every algorithm, c2 has a1 and a3, c3 only a2.
    fn populated_pairs() -> Vec<(&'static str, &'static str)> {
        vec![
            ("c1", "a1"),
            ("c1", "a2"),
            ("c1", "a3"),
            ("c2", "a1"),
            ("c2", "a3"),
            ("c3", "a2"),
        ]
    }

    async fn sqlite(dir: &std::path::Path) -> DatabaseBackend {
        let datasource = DatasourceConfig {
            name: "lbDS".to_string(),
            url: format!("sqlite://{}/lb.db?mode=rwc", dir.display()),
            max_connections: 2,
        };
        DatabaseBackend::connect("load_balancer", &datasource)
            .await
            .unwrap()
    }

    async fn populate(backend: &dyn PersistenceBackend, pairs: &[(&str, &str)]) {
        for (c, a) in pairs {
            let key = PersistenceKey::new(*c, *a).unwrap();
            let state = Arc::new(RawState::new(format!("{c}/{a}").into_bytes()));
            backend.store(&key, state).await.unwrap();
        }
    }

    fn patterns() -> Vec<KeyPattern> {
        let mut patterns = vec![KeyPattern::all()];
        for c in CHANNELS {
            patterns.push(KeyPattern::channel(c).unwrap());
        }
        for a in ALGORITHMS {
            patterns.push(KeyPattern::algorithm(a).unwrap());
        }
        for c in CHANNELS {
            for a in ALGORITHMS {
                patterns.push(KeyPattern::exact(c, a).unwrap());
            }
        }
        patterns
    }

    async fn snapshot(backend: &dyn PersistenceBackend) -> Vec<Vec<String>> {
        let mut results = Vec::new();
        for pattern in patterns() {
            results.push(backend.list(&pattern).await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn file_and_database_list_identically() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileBackend::new(dir.path().join("files"));
        let db = sqlite(dir.path()).await;

        populate(&file, &populated_pairs()).await;
        populate(&db, &populated_pairs()).await;

        assert_eq!(snapshot(&file).await, snapshot(&db).await);
        assert_eq!(
            file.list(&KeyPattern::algorithm("a2").unwrap()).await.unwrap(),
            vec!["c1", "c3"]
        );
    }

    #[tokio::test]
    async fn file_and_database_delete_identically() {
        for pattern in patterns() {
            let dir = tempfile::tempdir().unwrap();
            let file = FileBackend::new(dir.path().join("files"));
            let db = sqlite(dir.path()).await;
            populate(&file, &populated_pairs()).await;
            populate(&db, &populated_pairs()).await;

            file.delete(&pattern).await.unwrap();
            db.delete(&pattern).await.unwrap();

            assert_eq!(
                snapshot(&file).await,
                snapshot(&db).await,
                "after delete {pattern}"
            );
            db.close().await.unwrap();
        }
    }

    async fn delete_algorithm_scenario(backend: &dyn PersistenceBackend) {
        populate(backend, &[("c1", "a1"), ("c1", "a2"), ("c2", "a1"), ("c2", "a2")]).await;

        backend
            .delete(&KeyPattern::algorithm("a1").unwrap())
            .await
            .unwrap();

        for c in ["c1", "c2"] {
            let gone = PersistenceKey::new(c, "a1").unwrap();
            let kept = PersistenceKey::new(c, "a2").unwrap();
            assert!(backend.load(&gone).await.unwrap().is_none());
            assert_eq!(
                backend.load(&kept).await.unwrap(),
                Some(format!("{c}/a2").into_bytes())
            );
        }
        assert_eq!(
            backend.list(&KeyPattern::channel("c1").unwrap()).await.unwrap(),
            vec!["a2"]
        );
        assert_eq!(
            backend.list(&KeyPattern::all()).await.unwrap(),
            vec!["c1", "c2"]
        );
    }

    #[tokio::test]
    async fn delete_algorithm_across_channels_on_file() {
        let dir = tempfile::tempdir().unwrap();
        delete_algorithm_scenario(&FileBackend::new(dir.path())).await;
    }

    #[tokio::test]
    async fn delete_algorithm_across_channels_on_database() {
        let dir = tempfile::tempdir().unwrap();
        delete_algorithm_scenario(&sqlite(dir.path()).await).await;
    }
}
