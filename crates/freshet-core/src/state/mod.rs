//! # State Store Module
//!
//! Sorted key-value state maintained incrementally by the executor and
//! read concurrently by the query service.
//!
//! ## State Backends
//!
//! - **[`InMemoryStore`]**: `BTreeMap`-based, O(log n + k) prefix/range scans
//! - Durable changelog-backed stores live in `freshet-storage` and wrap an
//!   in-memory index behind the same trait
//!
//! ## Example
//!
//! ```rust,ignore
//! use freshet_core::state::{StateStore, StateStoreExt, InMemoryStore};
//!
//! let mut store = InMemoryStore::new();
//! store.put(b"user:1", b"alice").unwrap();
//! assert_eq!(store.get(b"user:1").unwrap().as_ref(), b"alice");
//!
//! store.put_typed(b"count", &42u64).unwrap();
//! let count: u64 = store.get_typed(b"count").unwrap().unwrap();
//! assert_eq!(count, 42);
//! ```

mod shared;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, Range};

use bytes::Bytes;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};

pub use shared::{SharedStore, StoreRegistry};

/// Compute the lexicographic successor of a byte prefix.
///
/// Returns `None` if no successor exists (empty prefix or all bytes 0xFF).
/// Used by `BTreeMap::range()` to bound prefix scans.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    if prefix.is_empty() {
        return None;
    }
    let mut successor = prefix.to_vec();
    while let Some(last) = successor.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(successor);
        }
        successor.pop();
    }
    None
}

/// Trait for state store implementations.
///
/// # Thread Safety
///
/// Stores are `Send` but not `Sync`. Concurrent access goes through
/// [`SharedStore`], which serializes writers and readers around a lock so
/// queries observe a consistent snapshot.
///
/// # Memory Model
///
/// - `get()` returns `Bytes`, a cheap reference-counted handle
/// - `put()` copies the input into the store
pub trait StateStore: Send {
    /// Get a value by key. Returns `None` if the key does not exist.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// Durable implementations must log the mutation before acknowledging.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the write or its changelog append fails.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError>;

    /// Delete a key. No error if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the operation fails.
    fn delete(&mut self, key: &[u8]) -> Result<(), StateError>;

    /// Scan all keys with a given prefix, in lexicographic order.
    fn prefix_scan<'a>(&'a self, prefix: &'a [u8])
        -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Range scan over `start <= key < end`, in lexicographic order.
    ///
    /// The sequence is finite and a fresh call restarts it from the top.
    fn range_scan<'a>(
        &'a self,
        range: Range<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Check if a key exists.
    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Approximate size of keys plus values in bytes.
    fn size_bytes(&self) -> usize;

    /// Number of entries in the store.
    fn len(&self) -> usize;

    /// Check if the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a snapshot of the full contents for checkpointing.
    fn snapshot(&self) -> StateSnapshot;

    /// Replace the current contents with a snapshot's.
    fn restore(&mut self, snapshot: StateSnapshot);

    /// Clear all entries.
    fn clear(&mut self);

    /// Flush pending writes to durable storage.
    ///
    /// No-op for purely in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the flush fails.
    fn flush(&mut self) -> Result<(), StateError> {
        Ok(())
    }

    /// Record committed source offsets alongside the state.
    ///
    /// Durable implementations append a commit marker to their changelog
    /// so recovery can resume from the right log positions. The executor
    /// calls this after `flush()` and before committing offsets to the
    /// source. No-op for purely in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the marker cannot be made durable.
    fn commit(&mut self, offsets: &HashMap<String, i64>) -> Result<(), StateError> {
        let _ = offsets;
        Ok(())
    }
}

/// Extension trait for [`StateStore`] providing typed access.
///
/// Generic methods cannot live on the dyn-compatible `StateStore` trait.
/// Uses rkyv; types must derive `Archive`, `rkyv::Serialize`, and
/// `rkyv::Deserialize`.
pub trait StateStoreExt: StateStore {
    /// Get a value and deserialize it.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if deserialization fails.
    fn get_typed<T>(&self, key: &[u8]) -> Result<Option<T>, StateError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
            + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
    {
        match self.get(key) {
            Some(bytes) => {
                let archived = rkyv::access::<T::Archived, RkyvError>(&bytes)
                    .map_err(|e| StateError::Serialization(e.to_string()))?;
                let value = rkyv::deserialize::<T, RkyvError>(archived)
                    .map_err(|e| StateError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Serialize and store a value.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if serialization fails.
    fn put_typed<T>(&mut self, key: &[u8], value: &T) -> Result<(), StateError>
    where
        T: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    {
        let bytes = rkyv::to_bytes::<RkyvError>(value)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        self.put(key, &bytes)
    }

    /// Update a value in place. `None` from the closure deletes the key.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the put or delete fails.
    fn update<F>(&mut self, key: &[u8], f: F) -> Result<(), StateError>
    where
        F: FnOnce(Option<Bytes>) -> Option<Vec<u8>>,
    {
        let current = self.get(key);
        match f(current) {
            Some(new_value) => self.put(key, &new_value),
            None => self.delete(key),
        }
    }
}

impl<T: StateStore + ?Sized> StateStoreExt for T {}

/// A snapshot of store contents for checkpointing.
///
/// Serializable with rkyv for persistence; restoring replaces the store's
/// contents with the snapshot's.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct StateSnapshot {
    /// Key-value pairs captured at snapshot time.
    data: Vec<(Vec<u8>, Vec<u8>)>,
    /// Format version for forward compatibility.
    version: u32,
}

impl StateSnapshot {
    /// Create a snapshot from key-value pairs.
    #[must_use]
    pub fn new(data: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { data, version: 1 }
    }

    /// The captured pairs.
    #[must_use]
    pub fn data(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.data
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Approximate size of keys plus values in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.data.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Serialize with rkyv.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` on failure.
    pub fn to_bytes(&self) -> Result<AlignedVec, StateError> {
        rkyv::to_bytes::<RkyvError>(self).map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Deserialize with rkyv.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` on failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let archived = rkyv::access::<<Self as Archive>::Archived, RkyvError>(bytes)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        rkyv::deserialize::<Self, RkyvError>(archived)
            .map_err(|e| StateError::Serialization(e.to_string()))
    }
}

/// In-memory state store using `BTreeMap` for sorted key access.
///
/// Suitable for state that fits in memory. `BTreeMap` gives O(log n + k)
/// prefix and range scans, which windowed aggregation lookups rely on.
pub struct InMemoryStore {
    /// The underlying sorted map.
    data: BTreeMap<Vec<u8>, Bytes>,
    /// Running size for monitoring.
    size_bytes: usize,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            size_bytes: 0,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStore {
    #[inline]
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    #[inline]
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        let value_bytes = Bytes::copy_from_slice(value);

        // Entry API: single tree traversal for both insert and update
        match self.data.entry(key.to_vec()) {
            Entry::Occupied(mut entry) => {
                self.size_bytes -= entry.get().len();
                self.size_bytes += value.len();
                *entry.get_mut() = value_bytes;
            }
            Entry::Vacant(entry) => {
                self.size_bytes += key.len() + value.len();
                entry.insert(value_bytes);
            }
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        if let Some(old_value) = self.data.remove(key) {
            self.size_bytes -= key.len() + old_value.len();
        }
        Ok(())
    }

    fn prefix_scan<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        if prefix.is_empty() {
            return Box::new(
                self.data
                    .iter()
                    .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
            );
        }
        if let Some(end) = prefix_successor(prefix) {
            Box::new(
                self.data
                    .range::<[u8], _>((Bound::Included(prefix), Bound::Excluded(end.as_slice())))
                    .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
            )
        } else {
            // All-0xFF prefix: scan from prefix to end
            Box::new(
                self.data
                    .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
                    .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
            )
        }
    }

    fn range_scan<'a>(
        &'a self,
        range: Range<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        if range.start >= range.end {
            return Box::new(std::iter::empty());
        }
        Box::new(
            self.data
                .range::<[u8], _>((Bound::Included(range.start), Bound::Excluded(range.end)))
                .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
        )
    }

    #[inline]
    fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn snapshot(&self) -> StateSnapshot {
        let data: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.to_vec()))
            .collect();
        StateSnapshot::new(data)
    }

    fn restore(&mut self, snapshot: StateSnapshot) {
        self.data.clear();
        self.size_bytes = 0;

        for (key, value) in snapshot.data {
            self.size_bytes += key.len() + value.len();
            self.data.insert(key, Bytes::from(value));
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.size_bytes = 0;
    }
}

/// Errors that can occur in state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// I/O error. Fatal: requires restart and changelog replay.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Corruption detected in durable state
    #[error("Corruption error: {0}")]
    Corruption(String),

    /// Store is replaying its changelog and not yet serving reads.
    /// Transient: retry with backoff.
    #[error("Store '{0}' is not ready (replay in progress)")]
    NotReady(String),

    /// Operation not supported by this store type
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store_basic() {
        let mut store = InMemoryStore::new();

        store.put(b"key1", b"value1").unwrap();
        assert_eq!(store.get(b"key1").unwrap().as_ref(), b"value1");
        assert!(store.get(b"missing").is_none());
        assert!(store.contains(b"key1"));
        assert_eq!(store.len(), 1);

        store.put(b"key1", b"value2").unwrap();
        assert_eq!(store.get(b"key1").unwrap().as_ref(), b"value2");
        assert_eq!(store.len(), 1);

        store.delete(b"key1").unwrap();
        assert!(store.get(b"key1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_missing_key_is_noop() {
        let mut store = InMemoryStore::new();
        store.delete(b"never-inserted").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_range_scan_ordered() {
        let mut store = InMemoryStore::new();
        store.put(b"c", b"3").unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.put(b"d", b"4").unwrap();

        let results: Vec<_> = store.range_scan(&b"a"[..]..&b"d"[..]).collect();
        let keys: Vec<&[u8]> = results.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
    }

    #[test]
    fn test_range_scan_empty_store() {
        let store = InMemoryStore::new();
        assert_eq!(store.range_scan(&b"a"[..]..&b"z"[..]).count(), 0);
    }

    #[test]
    fn test_range_scan_inverted_bounds_is_empty() {
        let mut store = InMemoryStore::new();
        store.put(b"m", b"1").unwrap();
        assert_eq!(store.range_scan(&b"z"[..]..&b"a"[..]).count(), 0);
    }

    #[test]
    fn test_range_scan_restartable() {
        let mut store = InMemoryStore::new();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();

        let first: Vec<_> = store.range_scan(&b"a"[..]..&b"z"[..]).collect();
        let second: Vec<_> = store.range_scan(&b"a"[..]..&b"z"[..]).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_prefix_scan() {
        let mut store = InMemoryStore::new();
        store.put(b"user:1", b"alice").unwrap();
        store.put(b"user:2", b"bob").unwrap();
        store.put(b"order:1", b"widget").unwrap();

        let users: Vec<_> = store.prefix_scan(b"user:").collect();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].1.as_ref(), b"alice");
        assert_eq!(users[1].1.as_ref(), b"bob");
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_successor(b"ab\xff"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(b"\xff\xff"), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut store = InMemoryStore::new();
        store.put(b"k1", b"v1").unwrap();
        store.put(b"k2", b"v2").unwrap();

        let snapshot = store.snapshot();
        store.clear();
        assert!(store.is_empty());

        store.restore(snapshot);
        assert_eq!(store.get(b"k1").unwrap().as_ref(), b"v1");
        assert_eq!(store.get(b"k2").unwrap().as_ref(), b"v2");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_snapshot_serialization_roundtrip() {
        let mut store = InMemoryStore::new();
        store.put(b"k", b"v").unwrap();

        let bytes = store.snapshot().to_bytes().unwrap();
        let restored = StateSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.data()[0], (b"k".to_vec(), b"v".to_vec()));
    }

    #[test]
    fn test_typed_access() {
        let mut store = InMemoryStore::new();
        store.put_typed(b"count", &42u64).unwrap();
        let count: u64 = store.get_typed(b"count").unwrap().unwrap();
        assert_eq!(count, 42);

        let missing: Option<u64> = store.get_typed(b"absent").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_update() {
        let mut store = InMemoryStore::new();
        store.put(b"k", b"aa").unwrap();
        store
            .update(b"k", |current| {
                let mut v = current.map(|b| b.to_vec()).unwrap_or_default();
                v.push(b'b');
                Some(v)
            })
            .unwrap();
        assert_eq!(store.get(b"k").unwrap().as_ref(), b"aab");

        store.update(b"k", |_| None).unwrap();
        assert!(store.get(b"k").is_none());
    }

    #[test]
    fn test_size_accounting() {
        let mut store = InMemoryStore::new();
        store.put(b"abc", b"12345").unwrap();
        assert_eq!(store.size_bytes(), 8);
        store.put(b"abc", b"12").unwrap();
        assert_eq!(store.size_bytes(), 5);
        store.delete(b"abc").unwrap();
        assert_eq!(store.size_bytes(), 0);
    }
}
