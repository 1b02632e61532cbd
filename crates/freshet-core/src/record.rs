//! Record types flowing through the runtime.
//!
//! A [`Record`] is what the log source hands to the executor: a key/value
//! pair plus its coordinates in the log. A [`StreamEntry`] is what flows
//! along topology edges once the source node has stripped the coordinates.

use bytes::Bytes;

/// A single record read from a partitioned log.
///
/// Immutable once read. Ordering is total within a partition and undefined
/// across partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Record key. Drives partitioning and grouping.
    pub key: Bytes,
    /// Record value.
    pub value: Bytes,
    /// Event timestamp in epoch milliseconds.
    pub timestamp: i64,
}

impl Record {
    /// Strips log coordinates, leaving the pair that flows through the topology.
    #[must_use]
    pub fn into_entry(self) -> StreamEntry {
        StreamEntry {
            key: self.key,
            value: self.value,
            timestamp: self.timestamp,
        }
    }
}

/// A keyed pair flowing along topology edges.
///
/// `Bytes` keeps clones cheap when an entry fans out to several
/// downstream nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Current key. Rewritten by group-by nodes.
    pub key: Bytes,
    /// Current value.
    pub value: Bytes,
    /// Event timestamp in epoch milliseconds, carried from the source record.
    pub timestamp: i64,
}

impl StreamEntry {
    /// Creates an entry from owned parts.
    #[must_use]
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
        }
    }

    /// Returns a copy of this entry with a different key.
    #[must_use]
    pub fn with_key(&self, key: Bytes) -> Self {
        Self {
            key,
            value: self.value.clone(),
            timestamp: self.timestamp,
        }
    }
}
