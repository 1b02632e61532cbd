//! Changelog-backed durable state store.
//!
//! [`DurableStore`] wraps an in-memory index and logs every mutation to a
//! [`Changelog`] before applying it. `flush()` syncs the changelog;
//! `commit()` appends an offset marker after the sync, which is the
//! at-least-once boundary the executor relies on.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use freshet_core::state::{InMemoryStore, StateError, StateSnapshot, StateStore};

use crate::changelog::{Changelog, ChangelogEntry};
use crate::checkpoint::CheckpointManager;

/// A state store backed by a changelog for durability.
///
/// Layout under the store directory:
///
/// ```text
/// <dir>/changelog      append-only mutation log
/// <dir>/checkpoints/   periodic snapshots (if enabled)
/// ```
///
/// On restart, [`recover`](Self::recover) rebuilds the index from the
/// newest checkpoint plus the changelog tail.
pub struct DurableStore {
    /// Store name, used in logs and error messages.
    pub(crate) name: String,
    /// The in-memory index the changelog protects.
    pub(crate) inner: InMemoryStore,
    /// Write-ahead changelog.
    pub(crate) changelog: Changelog,
    /// Store directory.
    pub(crate) dir: PathBuf,
    /// Checkpoint manager, if checkpointing is enabled.
    pub(crate) checkpoints: Option<CheckpointManager>,
    /// Last checkpoint time.
    pub(crate) last_checkpoint: Instant,
    /// Offsets from the most recent commit marker (written or recovered).
    pub(crate) committed_offsets: HashMap<String, i64>,
}

impl DurableStore {
    /// Opens (or creates) a durable store under `dir`.
    ///
    /// Does not replay the changelog; call [`recover`](Self::recover)
    /// before serving reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or changelog cannot be created.
    pub fn open(name: &str, dir: &Path, sync_interval: Duration) -> Result<Self, StateError> {
        std::fs::create_dir_all(dir)?;
        let changelog = Changelog::open(dir.join("changelog"), sync_interval)?;

        Ok(Self {
            name: name.to_string(),
            inner: InMemoryStore::new(),
            changelog,
            dir: dir.to_path_buf(),
            checkpoints: None,
            last_checkpoint: Instant::now(),
            committed_offsets: HashMap::new(),
        })
    }

    /// Enables periodic checkpointing.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint directory cannot be created.
    pub fn enable_checkpointing(
        &mut self,
        interval: Duration,
        max_retained: usize,
    ) -> Result<(), StateError> {
        let manager = CheckpointManager::new(self.dir.join("checkpoints"), interval, max_retained)
            .map_err(|e| StateError::Io(std::io::Error::other(e)))?;
        self.checkpoints = Some(manager);
        Ok(())
    }

    /// The store's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offsets recorded by the most recent commit marker.
    #[must_use]
    pub fn committed_offsets(&self) -> &HashMap<String, i64> {
        &self.committed_offsets
    }

    /// Enable changelog sync on every append (for testing).
    pub fn set_sync_on_write(&mut self, enabled: bool) {
        self.changelog.set_sync_on_write(enabled);
    }

    /// Whether the checkpoint interval has elapsed.
    fn should_checkpoint(&self) -> bool {
        self.checkpoints
            .as_ref()
            .is_some_and(|mgr| self.last_checkpoint.elapsed() >= mgr.interval())
    }

    /// Snapshots current state into a new checkpoint.
    fn write_checkpoint(&mut self) -> Result<(), StateError> {
        let snapshot_bytes = self.inner.snapshot().to_bytes()?;
        let position = self.changelog.position();
        let Some(manager) = self.checkpoints.as_mut() else {
            return Ok(());
        };
        manager
            .create(&snapshot_bytes, position, &self.committed_offsets)
            .map_err(|e| StateError::Io(std::io::Error::other(e)))?;
        self.last_checkpoint = Instant::now();
        debug!(store = %self.name, position, "checkpoint written");
        Ok(())
    }
}

impl StateStore for DurableStore {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        // Log first, apply second: the mutation must be recoverable before
        // it becomes observable.
        self.changelog.append(&ChangelogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.inner.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.changelog
            .append(&ChangelogEntry::Delete { key: key.to_vec() })?;
        self.inner.delete(key)
    }

    fn prefix_scan<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        self.inner.prefix_scan(prefix)
    }

    fn range_scan<'a>(
        &'a self,
        range: Range<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        self.inner.range_scan(range)
    }

    fn size_bytes(&self) -> usize {
        self.inner.size_bytes()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn snapshot(&self) -> StateSnapshot {
        self.inner.snapshot()
    }

    fn restore(&mut self, snapshot: StateSnapshot) {
        self.inner.restore(snapshot);
    }

    fn clear(&mut self) {
        self.inner.clear();
    }

    fn flush(&mut self) -> Result<(), StateError> {
        self.changelog.sync()?;
        Ok(())
    }

    fn commit(&mut self, offsets: &HashMap<String, i64>) -> Result<(), StateError> {
        self.changelog.append(&ChangelogEntry::Commit {
            offsets: offsets.clone(),
        })?;
        self.changelog.sync()?;
        self.committed_offsets = offsets.clone();

        if self.should_checkpoint() {
            self.write_checkpoint()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("entries", &self.inner.len())
            .finish_non_exhaustive()
    }
}
