//! Relational [`PersistenceBackend`] over a pooled `sqlx` datasource.
//!
//! All states live in one table:
//!
//! ```sql
//! CREATE TABLE <table_name> (
//!   CHANNEL_ID   VARCHAR(250) NOT NULL,
//!   ALGORITHM_ID VARCHAR(250) NOT NULL,
//!   STATE        BLOB NOT NULL,            -- BYTEA on PostgreSQL
//!   PRIMARY KEY (CHANNEL_ID, ALGORITHM_ID)
//! );
//! ```
//!
//! The table is created on startup if it does not exist. Both PostgreSQL and
//! SQLite datasources are supported through the `Any` driver; the statements
//! differ only in placeholders, the blob type, and how a `store` locks the row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lbstate_core::{KeyPattern, PersistenceKey, PersistentState, Scope};
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::{AnyPool, Row};
use tracing::{debug, warn};

use crate::config::DatasourceConfig;
use crate::storage::backend::{snapshot, PersistenceBackend};
use crate::storage::error::{ConfigurationError, PersistenceError};

/// Table name used when none is configured.
pub const DEFAULT_TABLE: &str = "load_balancer";

/// Datasource name used when none is configured.
pub const DEFAULT_DATASOURCE: &str = "loadBalancerDS";

/// Attempts made by `store` before a transient conflict is reported.
const MAX_STORE_ATTEMPTS: u32 = 5;

/// SQL codes worth retrying: serialization failure, deadlock and unique
/// violation (PostgreSQL); busy, busy snapshot and primary key (SQLite).
const RETRYABLE_CODES: &[&str] = &["40001", "40P01", "23505", "5", "517", "1555"];

/// SQL dialect of a datasource, derived from its URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Detects the dialect from a connection URL.
    #[must_use]
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }

    fn blob_type(self) -> &'static str {
        match self {
            Self::Postgres => "BYTEA",
            Self::Sqlite => "BLOB",
        }
    }

    /// Placeholder for the `n`-th (1-based) bind parameter.
    fn param(self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            Self::Sqlite => "?".to_string(),
        }
    }
}

/// Checks that `table` can be spliced into SQL text as a bare identifier.
fn validate_table_name(table: &str) -> Result<(), ConfigurationError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && table.len() <= 63 {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidParameter {
            name: "table_name",
            value: table.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

/// Every statement the backend runs, rendered once for a table and dialect.
#[derive(Debug)]
struct Statements {
    create_table: String,
    load: String,
    lock_for_update: String,
    update: String,
    insert: String,
    delete_all: String,
    delete_channel: String,
    delete_algorithm: String,
    delete_one: String,
    list_channels: String,
    list_algorithms: String,
    list_channels_with: String,
    list_one: String,
}

impl Statements {
    fn new(table: &str, dialect: Dialect) -> Self {
        let p = |n| dialect.param(n);
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 CHANNEL_ID VARCHAR(250) NOT NULL, \
                 ALGORITHM_ID VARCHAR(250) NOT NULL, \
                 STATE {} NOT NULL, \
                 PRIMARY KEY (CHANNEL_ID, ALGORITHM_ID))",
                dialect.blob_type()
            ),
            load: format!(
                "SELECT STATE FROM {table} WHERE CHANNEL_ID = {} AND ALGORITHM_ID = {}",
                p(1),
                p(2)
            ),
            lock_for_update: format!(
                "SELECT CHANNEL_ID FROM {table} WHERE CHANNEL_ID = {} AND ALGORITHM_ID = {} FOR UPDATE",
                p(1),
                p(2)
            ),
            update: format!(
                "UPDATE {table} SET STATE = {} WHERE CHANNEL_ID = {} AND ALGORITHM_ID = {}",
                p(1),
                p(2),
                p(3)
            ),
            insert: format!(
                "INSERT INTO {table} (CHANNEL_ID, ALGORITHM_ID, STATE) VALUES ({}, {}, {})",
                p(1),
                p(2),
                p(3)
            ),
            delete_all: format!("DELETE FROM {table}"),
            delete_channel: format!("DELETE FROM {table} WHERE CHANNEL_ID = {}", p(1)),
            delete_algorithm: format!("DELETE FROM {table} WHERE ALGORITHM_ID = {}", p(1)),
            delete_one: format!(
                "DELETE FROM {table} WHERE CHANNEL_ID = {} AND ALGORITHM_ID = {}",
                p(1),
                p(2)
            ),
            list_channels: format!("SELECT DISTINCT CHANNEL_ID FROM {table}"),
            list_algorithms: format!("SELECT ALGORITHM_ID FROM {table} WHERE CHANNEL_ID = {}", p(1)),
            list_channels_with: format!(
                "SELECT CHANNEL_ID FROM {table} WHERE ALGORITHM_ID = {}",
                p(1)
            ),
            list_one: format!(
                "SELECT ALGORITHM_ID FROM {table} WHERE CHANNEL_ID = {} AND ALGORITHM_ID = {}",
                p(1),
                p(2)
            ),
        }
    }

    /// Statement and arguments for a scoped `delete` or `list`.
    fn scoped<'a>(&'a self, scope: Scope<'a>, delete: bool) -> (&'a str, Vec<&'a str>) {
        match (scope, delete) {
            (Scope::All, true) => (&self.delete_all, vec![]),
            (Scope::All, false) => (&self.list_channels, vec![]),
            (Scope::Channel(c), true) => (&self.delete_channel, vec![c]),
            (Scope::Channel(c), false) => (&self.list_algorithms, vec![c]),
            (Scope::Algorithm(a), true) => (&self.delete_algorithm, vec![a]),
            (Scope::Algorithm(a), false) => (&self.list_channels_with, vec![a]),
            (Scope::Exact(c, a), true) => (&self.delete_one, vec![c, a]),
            (Scope::Exact(c, a), false) => (&self.list_one, vec![c, a]),
        }
    }
}

// ---------------------------------------------------------------------------
// DatabaseBackend
// ---------------------------------------------------------------------------

/// Single-table backend with transactional upserts.
pub struct DatabaseBackend {
    pool: AnyPool,
    table: String,
    dialect: Dialect,
    sql: Statements,
}

impl DatabaseBackend {
    /// Connects to `datasource` and creates `table` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the table name is not a plain
    /// identifier, the URL scheme is unsupported, or the database cannot be
    /// reached or the table cannot be created.
    pub async fn connect(
        table: &str,
        datasource: &DatasourceConfig,
    ) -> Result<Self, ConfigurationError> {
        validate_table_name(table)?;
        let dialect =
            Dialect::from_url(&datasource.url).ok_or_else(|| ConfigurationError::InvalidParameter {
                name: "datasource.url",
                value: datasource.url.clone(),
            })?;

        // Every connection to an in-memory SQLite database is a separate database.
        let max_connections = if datasource.url.contains(":memory:") {
            1
        } else {
            datasource.max_connections.max(1)
        };

        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&datasource.url)
            .await
            .map_err(|e| ConfigurationError::Backend(e.into()))?;

        let sql = Statements::new(table, dialect);
        sqlx::query(&sql.create_table)
            .execute(&pool)
            .await
            .map_err(|e| ConfigurationError::Backend(e.into()))?;

        debug!(table, datasource = %datasource.name, ?dialect, "database persistence ready");
        Ok(Self {
            pool,
            table: table.to_string(),
            dialect,
            sql,
        })
    }

    /// Builds a backend from configuration parameters
    /// `[table_name [datasource_name]]`, resolving the datasource by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::UnknownDatasource`] if no datasource has
    /// the requested name, or any error from [`connect`](Self::connect).
    pub async fn from_params(
        params: &[String],
        datasources: &[DatasourceConfig],
    ) -> Result<Self, ConfigurationError> {
        let table = params.first().map_or(DEFAULT_TABLE, String::as_str);
        let name = params.get(1).map_or(DEFAULT_DATASOURCE, String::as_str);
        let datasource = datasources
            .iter()
            .find(|ds| ds.name == name)
            .ok_or_else(|| ConfigurationError::UnknownDatasource(name.to_string()))?;
        Self::connect(table, datasource).await
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// One transactional upsert attempt.
    ///
    /// The transaction is rolled back on any failure. Isolation is set per
    /// transaction, so pooled connections go back with their defaults intact.
    async fn store_once(&self, key: &PersistenceKey, bytes: &[u8]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let outcome: Result<(), sqlx::Error> = async {
            let updated = match self.dialect {
                Dialect::Postgres => {
                    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                        .execute(&mut *tx)
                        .await?;
                    let exists = sqlx::query(&self.sql.lock_for_update)
                        .bind(key.channel_id())
                        .bind(key.algorithm_id())
                        .fetch_optional(&mut *tx)
                        .await?
                        .is_some();
                    if exists {
                        self.update(&mut tx, key, bytes).await?;
                    }
                    exists
                }
                // SQLite transactions are serializable; the UPDATE takes the
                // database write lock before the existence check matters.
                Dialect::Sqlite => self.update(&mut tx, key, bytes).await? > 0,
            };
            if !updated {
                sqlx::query(&self.sql.insert)
                    .bind(key.channel_id())
                    .bind(key.algorithm_id())
                    .bind(bytes)
                    .execute(&mut *tx)
                    .await?;
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(%key, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn update(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        key: &PersistenceKey,
        bytes: &[u8],
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(&self.sql.update)
            .bind(bytes)
            .bind(key.channel_id())
            .bind(key.algorithm_id())
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}

fn is_retryable(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| RETRYABLE_CODES.contains(&code.as_ref()))
}

#[async_trait]
impl PersistenceBackend for DatabaseBackend {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn load(&self, key: &PersistenceKey) -> Result<Option<Vec<u8>>, PersistenceError> {
        debug!(%key, "loading");
        let row = sqlx::query(&self.sql.load)
            .bind(key.channel_id())
            .bind(key.algorithm_id())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>(0)?)),
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        key: &PersistenceKey,
        state: Arc<dyn PersistentState>,
    ) -> Result<(), PersistenceError> {
        debug!(%key, "storing");
        let bytes = snapshot(state.as_ref())?;
        let mut attempt = 1;
        loop {
            match self.store_once(key, &bytes).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < MAX_STORE_ATTEMPTS && is_retryable(&e) => {
                    debug!(%key, attempt, error = %e, "retrying conflicting store");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete(&self, pattern: &KeyPattern) -> Result<(), PersistenceError> {
        debug!(%pattern, "deleting");
        let (sql, args) = self.sql.scoped(pattern.scope(), true);
        let mut query = sqlx::query(sql);
        for arg in args {
            query = query.bind(arg);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn list(&self, pattern: &KeyPattern) -> Result<Vec<String>, PersistenceError> {
        let (sql, args) = self.sql.scoped(pattern.scope(), false);
        let mut query = sqlx::query(sql);
        for arg in args {
            query = query.bind(arg);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut result = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?;
        result.sort();
        debug!(%pattern, ?result, "listed");
        Ok(result)
    }

    async fn close(&self) -> Result<(), PersistenceError> {
        self.pool.close().await;
        Ok(())
    }
}
