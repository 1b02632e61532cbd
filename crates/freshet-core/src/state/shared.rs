//! Shared store handles for concurrent executor/query access.
//!
//! The state store is the single shared-mutable resource between the
//! executor (writer) and the query service (readers). [`SharedStore`]
//! serializes access with a reader-writer lock so a query always observes
//! a happens-before-consistent snapshot, never a partially applied update.
//!
//! A store starts in the restoring state while its changelog replays;
//! reads during that window either fail with [`StateError::NotReady`] or
//! block until replay completes, per [`ReplayPolicy`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};

use crate::config::ReplayPolicy;

use super::{StateError, StateStore};

/// Boxed store behind the shared handle.
pub type BoxedStore = Box<dyn StateStore + Send + Sync>;

struct StoreInner {
    name: String,
    store: RwLock<BoxedStore>,
    ready: Mutex<bool>,
    ready_cv: Condvar,
}

/// A named, concurrently accessible state store handle.
///
/// Cheap to clone; all clones refer to the same store.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("name", &self.inner.name)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl SharedStore {
    /// Wraps a store that is immediately ready to serve reads.
    #[must_use]
    pub fn new(name: impl Into<String>, store: BoxedStore) -> Self {
        Self::with_readiness(name, store, true)
    }

    /// Wraps a store that is still replaying its changelog.
    ///
    /// Call [`mark_ready`](Self::mark_ready) once replay completes.
    #[must_use]
    pub fn restoring(name: impl Into<String>, store: BoxedStore) -> Self {
        Self::with_readiness(name, store, false)
    }

    fn with_readiness(name: impl Into<String>, store: BoxedStore, ready: bool) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                store: RwLock::new(store),
                ready: Mutex::new(ready),
                ready_cv: Condvar::new(),
            }),
        }
    }

    /// The store's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the store is serving reads.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.lock()
    }

    /// Marks replay complete and wakes blocked readers.
    pub fn mark_ready(&self) {
        let mut ready = self.inner.ready.lock();
        *ready = true;
        self.inner.ready_cv.notify_all();
    }

    /// Point lookup.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotReady`] under [`ReplayPolicy::Fail`] while
    /// the store is replaying; blocks instead under [`ReplayPolicy::Block`].
    pub fn get(&self, key: &[u8], policy: ReplayPolicy) -> Result<Option<Bytes>, StateError> {
        self.wait_ready(policy)?;
        Ok(self.inner.store.read().get(key))
    }

    /// Range scan over `from <= key < to`, copied out under the read lock.
    ///
    /// Results are in ascending key order with no duplicates; an empty
    /// store yields an empty vector.
    ///
    /// # Errors
    ///
    /// Same readiness behavior as [`get`](Self::get).
    pub fn range(
        &self,
        from: &[u8],
        to: &[u8],
        policy: ReplayPolicy,
    ) -> Result<Vec<(Bytes, Bytes)>, StateError> {
        self.wait_ready(policy)?;
        Ok(self.inner.store.read().range_scan(from..to).collect())
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Same readiness behavior as [`get`](Self::get).
    pub fn len(&self, policy: ReplayPolicy) -> Result<usize, StateError> {
        self.wait_ready(policy)?;
        Ok(self.inner.store.read().len())
    }

    /// Whether the store has no entries.
    ///
    /// # Errors
    ///
    /// Same readiness behavior as [`get`](Self::get).
    pub fn is_empty(&self, policy: ReplayPolicy) -> Result<bool, StateError> {
        Ok(self.len(policy)? == 0)
    }

    /// Exclusive write access for the executor and for recovery.
    ///
    /// Readers are excluded for the guard's lifetime, which is what makes
    /// an aggregation update invisible until fully applied.
    #[must_use]
    pub fn write(&self) -> RwLockWriteGuard<'_, BoxedStore> {
        self.inner.store.write()
    }

    fn wait_ready(&self, policy: ReplayPolicy) -> Result<(), StateError> {
        let mut ready = self.inner.ready.lock();
        if *ready {
            return Ok(());
        }
        match policy {
            ReplayPolicy::Fail => Err(StateError::NotReady(self.inner.name.clone())),
            ReplayPolicy::Block => {
                while !*ready {
                    self.inner.ready_cv.wait(&mut ready);
                }
                Ok(())
            }
        }
    }
}

/// Registry of the stores declared by a topology.
///
/// Built once before the executor and query service start; immutable
/// afterwards and shared behind an `Arc`.
#[derive(Default)]
pub struct StoreRegistry {
    stores: FxHashMap<String, SharedStore>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("stores", &self.names())
            .finish()
    }
}

impl StoreRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a store handle under its name.
    ///
    /// A handle registered twice under the same name replaces the first.
    pub fn register(&mut self, store: SharedStore) {
        self.stores.insert(store.name().to_string(), store);
    }

    /// Looks up a store by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SharedStore> {
        self.stores.get(name)
    }

    /// Registered store names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered stores.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Iterates over registered store handles.
    pub fn iter(&self) -> impl Iterator<Item = &SharedStore> {
        self.stores.values()
    }

    /// Commits source offsets on every registered store.
    ///
    /// # Errors
    ///
    /// Returns the first [`StateError`] raised by a store.
    pub fn commit_all(&self, offsets: &HashMap<String, i64>) -> Result<(), StateError> {
        for store in self.stores.values() {
            store.write().commit(offsets)?;
        }
        Ok(())
    }

    /// Flushes every registered store.
    ///
    /// # Errors
    ///
    /// Returns the first [`StateError`] raised by a store.
    pub fn flush_all(&self) -> Result<(), StateError> {
        for store in self.stores.values() {
            store.write().flush()?;
        }
        Ok(())
    }
}
