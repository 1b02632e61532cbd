//! Log source abstraction.
//!
//! The runtime consumes an externally supplied durable, partitioned,
//! ordered log through [`LogSource`]: `subscribe` yields the assigned
//! partitions, `poll` returns batches of [`Record`]s, and `commit`
//! persists consumer-group offsets. [`InMemoryLog`] provides an
//! in-process implementation for tests and the demo pipeline.

mod memory;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use fxhash::FxHashMap;

use crate::record::Record;

pub use memory::{InMemoryConsumer, InMemoryLog};

/// A topic-partition pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition index within the topic.
    pub partition: i32,
}

impl TopicPartition {
    /// Creates a topic-partition pair.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Offsets keyed by topic-partition.
pub type OffsetMap = FxHashMap<TopicPartition, i64>;

/// Errors from log source operations.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The named topic does not exist.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Poll or commit before a subscribe.
    #[error("not subscribed to any topics")]
    NotSubscribed,

    /// The source connection was lost.
    #[error("source disconnected: {0}")]
    Disconnected(String),
}

/// A consumer over a partitioned, ordered log.
///
/// Offsets committed through [`commit`](Self::commit) are the positions
/// the group resumes from; per log convention they are next-to-read, i.e.
/// last processed offset plus one.
pub trait LogSource: Send {
    /// Subscribes to topics and returns the assigned partitions.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnknownTopic`] if a topic does not exist.
    fn subscribe(&mut self, topics: &[&str]) -> Result<Vec<TopicPartition>, SourceError>;

    /// Pulls the next batch of records, waiting up to `timeout` if none
    /// are immediately available. An empty vector means the timeout
    /// elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotSubscribed`] before a subscribe.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>, SourceError>;

    /// Commits next-to-read offsets for the consumer group.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotSubscribed`] before a subscribe.
    fn commit(&mut self, offsets: &OffsetMap) -> Result<(), SourceError>;
}

/// The producer side of a log, used by sink nodes.
pub trait LogSink: Send + Sync {
    /// Appends a record to `topic`, partitioned by key.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::UnknownTopic`] if the topic does not exist.
    fn produce(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        timestamp: i64,
    ) -> Result<(), SourceError>;
}

/// Deterministic partitioner mapping a key to a partition index.
///
/// The same function drives record placement in [`InMemoryLog`] and
/// instance ownership in the query layer, so the two always agree.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // partition counts are small
pub fn partition_for_key(key: &[u8], partitions: usize) -> i32 {
    debug_assert!(partitions > 0);
    (fxhash::hash64(key) % partitions as u64) as i32
}

/// Tracks the last processed offset for each topic-partition.
///
/// Stored offsets are last-processed; [`to_commit_map`](Self::to_commit_map)
/// returns offset+1 (next-to-read) per log convention.
#[derive(Debug, Clone, Default)]
pub struct OffsetTracker {
    offsets: OffsetMap,
}

impl OffsetTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the last processed offset for a partition.
    pub fn update(&mut self, tp: &TopicPartition, offset: i64) {
        self.offsets.insert(tp.clone(), offset);
    }

    /// Last processed offset for a partition, if any record was processed.
    #[must_use]
    pub fn get(&self, tp: &TopicPartition) -> Option<i64> {
        self.offsets.get(tp).copied()
    }

    /// Number of tracked partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.offsets.len()
    }

    /// Whether any offsets are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Next-to-read offsets for committing to the source.
    #[must_use]
    pub fn to_commit_map(&self) -> OffsetMap {
        self.offsets
            .iter()
            .map(|(tp, offset)| (tp.clone(), offset + 1))
            .collect()
    }

    /// Flat representation for changelog commit markers.
    ///
    /// Key format: `"{topic}-{partition}"`, value: next-to-read offset.
    #[must_use]
    pub fn to_string_map(&self) -> HashMap<String, i64> {
        self.offsets
            .iter()
            .map(|(tp, offset)| (tp.to_string(), offset + 1))
            .collect()
    }

    /// Rebuilds a tracker from a changelog commit marker.
    ///
    /// Parses keys in `"{topic}-{partition}"` format; values are
    /// next-to-read, so the tracked last-processed offset is value-1.
    #[must_use]
    pub fn from_string_map(map: &HashMap<String, i64>) -> Self {
        let mut tracker = Self::new();
        for (key, &next) in map {
            // Split at the last '-' to allow topic names containing dashes
            if let Some(dash) = key.rfind('-') {
                if let Ok(partition) = key[dash + 1..].parse::<i32>() {
                    let tp = TopicPartition::new(&key[..dash], partition);
                    tracker.update(&tp, next - 1);
                }
            }
        }
        tracker
    }

    /// Clears all tracked offsets.
    pub fn clear(&mut self) {
        self.offsets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_get() {
        let mut tracker = OffsetTracker::new();
        let tp0 = TopicPartition::new("events", 0);
        let tp1 = TopicPartition::new("events", 1);
        tracker.update(&tp0, 100);
        tracker.update(&tp1, 200);

        assert_eq!(tracker.get(&tp0), Some(100));
        assert_eq!(tracker.get(&tp1), Some(200));
        assert_eq!(tracker.get(&TopicPartition::new("events", 2)), None);
        assert_eq!(tracker.partition_count(), 2);
    }

    #[test]
    fn test_update_overwrites() {
        let mut tracker = OffsetTracker::new();
        let tp = TopicPartition::new("events", 0);
        tracker.update(&tp, 100);
        tracker.update(&tp, 200);
        assert_eq!(tracker.get(&tp), Some(200));
    }

    #[test]
    fn test_commit_map_is_next_to_read() {
        let mut tracker = OffsetTracker::new();
        let tp = TopicPartition::new("events", 0);
        tracker.update(&tp, 99);

        let commit = tracker.to_commit_map();
        assert_eq!(commit.get(&tp), Some(&100));
    }

    #[test]
    fn test_string_map_roundtrip() {
        let mut tracker = OffsetTracker::new();
        tracker.update(&TopicPartition::new("events", 0), 100);
        tracker.update(&TopicPartition::new("git-log", 3), 50);

        let map = tracker.to_string_map();
        let restored = OffsetTracker::from_string_map(&map);

        assert_eq!(restored.get(&TopicPartition::new("events", 0)), Some(100));
        assert_eq!(restored.get(&TopicPartition::new("git-log", 3)), Some(50));
        assert_eq!(restored.partition_count(), 2);
    }

    #[test]
    fn test_partitioner_is_deterministic_and_in_range() {
        for key in [&b"alice"[..], b"bob", b"", b"\x00\xff"] {
            let p = partition_for_key(key, 4);
            assert_eq!(p, partition_for_key(key, 4));
            assert!((0..4).contains(&p));
        }
    }
}
