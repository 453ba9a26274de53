//! File-system [`PersistenceBackend`].
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<channel_id>/<algorithm_id>.data       committed record
//! <root>/<channel_id>/<algorithm_id>.data.tmp   write in progress
//! ```
//!
//! A record is written to its `.tmp` sibling, synced, then renamed over the
//! final path. Readers therefore never observe a half-written record, and a
//! crash mid-write leaves only a `.tmp` file that is never loaded or listed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use lbstate_core::{KeyPattern, PersistenceKey, PersistentState, Scope};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::storage::backend::{snapshot, PersistenceBackend};
use crate::storage::error::PersistenceError;

/// Root directory used when none is configured, relative to the working directory.
pub const DEFAULT_ROOT: &str = "lb_persistence";

/// Suffix of committed record files.
pub const DATA_EXTENSION: &str = ".data";

/// Suffix of in-progress record files.
pub const TEMP_EXTENSION: &str = ".data.tmp";

/// Directory-per-channel, file-per-algorithm backend.
pub struct FileBackend {
    root: PathBuf,
    /// Serializes writers of the same record, which share one `.tmp` path.
    /// Bounded by the number of distinct keys ever stored.
    write_locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl FileBackend {
    /// Creates a backend rooted at `root`. Nothing is created on disk until
    /// the first `store`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: DashMap::new(),
        }
    }

    /// Creates a backend from configuration parameters: `[root]`.
    #[must_use]
    pub fn from_params(params: &[String]) -> Self {
        Self::new(params.first().map_or(DEFAULT_ROOT, String::as_str))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, channel_id: &str) -> PathBuf {
        self.root.join(channel_id)
    }

    fn record_path(channel_dir: &Path, algorithm_id: &str, temp: bool) -> PathBuf {
        let ext = if temp { TEMP_EXTENSION } else { DATA_EXTENSION };
        channel_dir.join(format!("{algorithm_id}{ext}"))
    }

    fn write_lock(&self, key: &PersistenceKey) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(key.id_pair())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn delete_everything(&self) -> Result<(), PersistenceError> {
        remove_dir_all_if_exists(&self.root).await
    }

    async fn delete_algorithm_everywhere(&self, algorithm_id: &str) -> Result<(), PersistenceError> {
        for (_, dir) in subdirectories(&self.root).await? {
            remove_file_if_exists(&Self::record_path(&dir, algorithm_id, false)).await?;
            remove_file_if_exists(&Self::record_path(&dir, algorithm_id, true)).await?;
            remove_dir_if_empty(&dir).await?;
        }
        Ok(())
    }

    async fn delete_one(&self, channel_id: &str, algorithm_id: &str) -> Result<(), PersistenceError> {
        let dir = self.channel_dir(channel_id);
        remove_file_if_exists(&Self::record_path(&dir, algorithm_id, false)).await?;
        remove_file_if_exists(&Self::record_path(&dir, algorithm_id, true)).await?;
        remove_dir_if_empty(&dir).await
    }

    /// Channels that hold at least one committed record.
    async fn list_channels(&self) -> Result<Vec<String>, PersistenceError> {
        let mut result = Vec::new();
        for (name, dir) in subdirectories(&self.root).await? {
            if !data_files(&dir).await?.is_empty() {
                result.push(name);
            }
        }
        Ok(result)
    }

    async fn list_channels_with(&self, algorithm_id: &str) -> Result<Vec<String>, PersistenceError> {
        let mut result = Vec::new();
        for (name, dir) in subdirectories(&self.root).await? {
            if exists(&Self::record_path(&dir, algorithm_id, false)).await? {
                result.push(name);
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl PersistenceBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self, key: &PersistenceKey) -> Result<Option<Vec<u8>>, PersistenceError> {
        debug!(%key, "loading");
        let path = Self::record_path(&self.channel_dir(key.channel_id()), key.algorithm_id(), false);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io(path, e)),
        }
    }

    async fn store(
        &self,
        key: &PersistenceKey,
        state: Arc<dyn PersistentState>,
    ) -> Result<(), PersistenceError> {
        debug!(%key, "storing");
        let bytes = snapshot(state.as_ref())?;
        let dir = self.channel_dir(key.channel_id());
        let tmp = Self::record_path(&dir, key.algorithm_id(), true);
        let path = Self::record_path(&dir, key.algorithm_id(), false);

        let lock = self.write_lock(key);
        let _guard = lock.lock().await;
        // A concurrent delete may remove the channel directory between
        // creating it and opening the temp file; retry once in that case.
        let mut attempts = 0;
        loop {
            attempts += 1;
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| PersistenceError::io(&dir, e))?;
            match write_atomically(&tmp, &path, &bytes).await {
                Err(PersistenceError::Io { source, .. })
                    if source.kind() == ErrorKind::NotFound && attempts < 2 => {}
                other => return other,
            }
        }
    }

    async fn delete(&self, pattern: &KeyPattern) -> Result<(), PersistenceError> {
        debug!(%pattern, "deleting");
        match pattern.scope() {
            Scope::All => self.delete_everything().await,
            Scope::Channel(channel) => remove_dir_all_if_exists(&self.channel_dir(channel)).await,
            Scope::Algorithm(algorithm) => self.delete_algorithm_everywhere(algorithm).await,
            Scope::Exact(channel, algorithm) => self.delete_one(channel, algorithm).await,
        }
    }

    async fn list(&self, pattern: &KeyPattern) -> Result<Vec<String>, PersistenceError> {
        let mut result = match pattern.scope() {
            Scope::All => self.list_channels().await?,
            Scope::Channel(channel) => data_files(&self.channel_dir(channel)).await?,
            Scope::Algorithm(algorithm) => self.list_channels_with(algorithm).await?,
            Scope::Exact(channel, algorithm) => {
                let path = Self::record_path(&self.channel_dir(channel), algorithm, false);
                if exists(&path).await? {
                    vec![algorithm.to_string()]
                } else {
                    Vec::new()
                }
            }
        };
        result.sort();
        debug!(%pattern, ?result, "listed");
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

/// Writes `bytes` to `tmp`, syncs it, then renames it over `path`.
async fn write_atomically(tmp: &Path, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let mut file = fs::File::create(tmp)
        .await
        .map_err(|e| PersistenceError::io(tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| PersistenceError::io(tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| PersistenceError::io(tmp, e))?;
    drop(file);

    fs::rename(tmp, path)
        .await
        .map_err(|e| PersistenceError::io(path, e))?;

    // Best effort: make the rename itself durable.
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }
    }
    Ok(())
}

async fn exists(path: &Path) -> Result<bool, PersistenceError> {
    fs::try_exists(path)
        .await
        .map_err(|e| PersistenceError::io(path, e))
}

/// Immediate subdirectories of `dir` as `(name, path)`. A missing `dir` has none.
async fn subdirectories(dir: &Path) -> Result<Vec<(String, PathBuf)>, PersistenceError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PersistenceError::io(dir, e)),
    };
    let mut result = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PersistenceError::io(dir, e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| PersistenceError::io(entry.path(), e))?;
        if !file_type.is_dir() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            result.push((name, entry.path()));
        }
    }
    Ok(result)
}

/// Algorithm ids of the committed records in a channel directory.
async fn data_files(dir: &Path) -> Result<Vec<String>, PersistenceError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PersistenceError::io(dir, e)),
    };
    let mut result = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PersistenceError::io(dir, e))?
    {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(algorithm) = name.strip_suffix(DATA_EXTENSION) else {
            trace!(file = %name, "skipping non-record file");
            continue;
        };
        let is_file = entry
            .file_type()
            .await
            .map_err(|e| PersistenceError::io(entry.path(), e))?
            .is_file();
        if is_file && !algorithm.is_empty() {
            result.push(algorithm.to_string());
        }
    }
    Ok(result)
}

async fn remove_file_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

async fn remove_dir_all_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

async fn remove_dir_if_empty(dir: &Path) -> Result<(), PersistenceError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PersistenceError::io(dir, e)),
    };
    let empty = entries
        .next_entry()
        .await
        .map_err(|e| PersistenceError::io(dir, e))?
        .is_none();
    if empty {
        match fs::remove_dir(dir).await {
            Ok(()) => {}
            // Lost a race with a concurrent store or delete.
            Err(e) => trace!(dir = %dir.display(), error = %e, "channel directory not removed"),
        }
    }
    Ok(())
}
