//! In-process partitioned log.
//!
//! [`InMemoryLog`] is an ordered, partitioned log living in process
//! memory: producers append through [`LogSink`], consumers read through
//! [`InMemoryConsumer`] handles implementing [`LogSource`]. Committed
//! offsets are stored per consumer group, so a new consumer for the same
//! group resumes where the previous one committed.
//!
//! It stands in for an external broker in tests and the demo pipeline;
//! the broker's wire protocol is outside this runtime's scope.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::record::Record;

use super::{partition_for_key, LogSink, LogSource, OffsetMap, SourceError, TopicPartition};

/// Maximum records returned by a single poll.
const MAX_POLL_RECORDS: usize = 256;

struct StoredRecord {
    key: Bytes,
    value: Bytes,
    timestamp: i64,
}

struct Topic {
    partitions: Vec<RwLock<Vec<StoredRecord>>>,
}

struct LogInner {
    topics: RwLock<FxHashMap<String, Topic>>,
    /// Committed next-to-read offsets per (group, topic-partition).
    committed: RwLock<FxHashMap<(String, TopicPartition), i64>>,
    /// Bumped on every append; poll waits on it.
    append_seq: Mutex<u64>,
    append_cv: Condvar,
}

/// An in-process partitioned log.
///
/// Cheap to clone; all clones share the same topics and committed offsets.
#[derive(Clone)]
pub struct InMemoryLog {
    inner: Arc<LogInner>,
}

impl std::fmt::Debug for InMemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.inner.topics.read();
        f.debug_struct("InMemoryLog")
            .field("topics", &topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LogInner {
                topics: RwLock::new(FxHashMap::default()),
                committed: RwLock::new(FxHashMap::default()),
                append_seq: Mutex::new(0),
                append_cv: Condvar::new(),
            }),
        }
    }

    /// Creates a topic with the given partition count.
    ///
    /// Creating an existing topic is a no-op; partition counts never
    /// change after creation.
    ///
    /// # Panics
    ///
    /// Panics if `partitions` is zero.
    pub fn create_topic(&self, name: &str, partitions: usize) {
        assert!(partitions > 0, "topic must have at least one partition");
        let mut topics = self.inner.topics.write();
        topics.entry(name.to_string()).or_insert_with(|| Topic {
            partitions: (0..partitions).map(|_| RwLock::new(Vec::new())).collect(),
        });
    }

    /// Number of partitions for a topic, if it exists.
    #[must_use]
    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|t| t.partitions.len())
    }

    /// End offset (next offset to be assigned) of a partition.
    #[must_use]
    pub fn end_offset(&self, tp: &TopicPartition) -> Option<i64> {
        let topics = self.inner.topics.read();
        let topic = topics.get(&tp.topic)?;
        let partition = topic.partitions.get(usize::try_from(tp.partition).ok()?)?;
        let len = partition.read().len() as i64;
        Some(len)
    }

    /// Committed next-to-read offset for a group on a partition.
    #[must_use]
    pub fn committed_offset(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        self.inner
            .committed
            .read()
            .get(&(group.to_string(), tp.clone()))
            .copied()
    }

    /// Opens a consumer for the given group.
    ///
    /// The consumer resumes from the group's committed offsets.
    #[must_use]
    pub fn consumer(&self, group: &str) -> InMemoryConsumer {
        InMemoryConsumer {
            log: self.clone(),
            group: group.to_string(),
            cursors: FxHashMap::default(),
            subscribed: false,
        }
    }

    fn notify_append(&self) {
        let mut seq = self.inner.append_seq.lock();
        *seq += 1;
        self.inner.append_cv.notify_all();
    }
}

impl LogSink for InMemoryLog {
    fn produce(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        timestamp: i64,
    ) -> Result<(), SourceError> {
        {
            let topics = self.inner.topics.read();
            let t = topics
                .get(topic)
                .ok_or_else(|| SourceError::UnknownTopic(topic.to_string()))?;
            let partition = partition_for_key(key, t.partitions.len());
            let mut records = t.partitions[partition as usize].write();
            records.push(StoredRecord {
                key: Bytes::copy_from_slice(key),
                value: Bytes::copy_from_slice(value),
                timestamp,
            });
        }
        self.notify_append();
        Ok(())
    }
}

/// A consumer-group cursor over an [`InMemoryLog`].
pub struct InMemoryConsumer {
    log: InMemoryLog,
    group: String,
    /// Next offset to read per assigned partition.
    cursors: FxHashMap<TopicPartition, i64>,
    subscribed: bool,
}

impl std::fmt::Debug for InMemoryConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConsumer")
            .field("group", &self.group)
            .field("assignment", &self.cursors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InMemoryConsumer {
    /// Collects available records from assigned partitions, bounded by
    /// `MAX_POLL_RECORDS`.
    fn fetch(&mut self) -> Vec<Record> {
        let mut out = Vec::new();
        let topics = self.log.inner.topics.read();

        let mut assignment: Vec<TopicPartition> = self.cursors.keys().cloned().collect();
        assignment.sort();

        for tp in assignment {
            if out.len() >= MAX_POLL_RECORDS {
                break;
            }
            let Some(topic) = topics.get(&tp.topic) else {
                continue;
            };
            let Ok(idx) = usize::try_from(tp.partition) else {
                continue;
            };
            let Some(partition) = topic.partitions.get(idx) else {
                continue;
            };

            let records = partition.read();
            let cursor = self.cursors.get_mut(&tp).expect("assigned partition");
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let mut next = *cursor as usize;
            while next < records.len() && out.len() < MAX_POLL_RECORDS {
                let stored = &records[next];
                out.push(Record {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: next as i64,
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                    timestamp: stored.timestamp,
                });
                next += 1;
            }
            *cursor = next as i64;
        }
        out
    }
}

impl LogSource for InMemoryConsumer {
    fn subscribe(&mut self, topics: &[&str]) -> Result<Vec<TopicPartition>, SourceError> {
        let known = self.log.inner.topics.read();
        let committed = self.log.inner.committed.read();

        let mut assignment = Vec::new();
        for &topic in topics {
            let t = known
                .get(topic)
                .ok_or_else(|| SourceError::UnknownTopic(topic.to_string()))?;
            for partition in 0..t.partitions.len() {
                #[allow(clippy::cast_possible_truncation)]
                let tp = TopicPartition::new(topic, partition as i32);
                let start = committed
                    .get(&(self.group.clone(), tp.clone()))
                    .copied()
                    .unwrap_or(0);
                self.cursors.insert(tp.clone(), start);
                assignment.push(tp);
            }
        }
        assignment.sort();
        self.subscribed = true;
        Ok(assignment)
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>, SourceError> {
        if !self.subscribed {
            return Err(SourceError::NotSubscribed);
        }

        let records = self.fetch();
        if !records.is_empty() {
            return Ok(records);
        }

        // Nothing buffered: wait for an append or the timeout.
        let deadline = Instant::now() + timeout;
        {
            let mut seq = self.log.inner.append_seq.lock();
            let seen = *seq;
            while *seq == seen {
                if self
                    .log
                    .inner
                    .append_cv
                    .wait_until(&mut seq, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }
        Ok(self.fetch())
    }

    fn commit(&mut self, offsets: &OffsetMap) -> Result<(), SourceError> {
        if !self.subscribed {
            return Err(SourceError::NotSubscribed);
        }
        let mut committed = self.log.inner.committed.write();
        for (tp, &offset) in offsets {
            committed.insert((self.group.clone(), tp.clone()), offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_topic(partitions: usize) -> InMemoryLog {
        let log = InMemoryLog::new();
        log.create_topic("events", partitions);
        log
    }

    #[test]
    fn test_produce_and_poll() {
        let log = log_with_topic(1);
        log.produce("events", b"k1", b"v1", 10).unwrap();
        log.produce("events", b"k2", b"v2", 20).unwrap();

        let mut consumer = log.consumer("g1");
        let assignment = consumer.subscribe(&["events"]).unwrap();
        assert_eq!(assignment, vec![TopicPartition::new("events", 0)]);

        let records = consumer.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[1].offset, 1);
        assert_eq!(records[0].value.as_ref(), b"v1");
    }

    #[test]
    fn test_partition_ordering_preserved() {
        let log = log_with_topic(4);
        for i in 0..20u32 {
            log.produce("events", b"same-key", &i.to_be_bytes(), 0)
                .unwrap();
        }

        let mut consumer = log.consumer("g1");
        consumer.subscribe(&["events"]).unwrap();
        let records = consumer.poll(Duration::from_millis(10)).unwrap();

        // Same key always lands in one partition, in append order.
        assert_eq!(records.len(), 20);
        let partition = records[0].partition;
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.partition, partition);
            assert_eq!(record.offset, i as i64);
        }
    }

    #[test]
    fn test_poll_before_subscribe_fails() {
        let log = log_with_topic(1);
        let mut consumer = log.consumer("g1");
        assert!(matches!(
            consumer.poll(Duration::from_millis(1)),
            Err(SourceError::NotSubscribed)
        ));
    }

    #[test]
    fn test_subscribe_unknown_topic_fails() {
        let log = InMemoryLog::new();
        let mut consumer = log.consumer("g1");
        assert!(matches!(
            consumer.subscribe(&["nope"]),
            Err(SourceError::UnknownTopic(t)) if t == "nope"
        ));
    }

    #[test]
    fn test_commit_resumes_new_consumer() {
        let log = log_with_topic(1);
        for i in 0..5u32 {
            log.produce("events", b"k", &i.to_be_bytes(), 0).unwrap();
        }

        let tp = TopicPartition::new("events", 0);
        let mut first = log.consumer("g1");
        first.subscribe(&["events"]).unwrap();
        let records = first.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(records.len(), 5);

        let mut offsets = OffsetMap::default();
        offsets.insert(tp.clone(), 3); // processed 0..=2
        first.commit(&offsets).unwrap();
        assert_eq!(log.committed_offset("g1", &tp), Some(3));

        let mut second = log.consumer("g1");
        second.subscribe(&["events"]).unwrap();
        let replayed = second.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].offset, 3);
    }

    #[test]
    fn test_uncommitted_group_starts_at_zero() {
        let log = log_with_topic(1);
        log.produce("events", b"k", b"v", 0).unwrap();

        let mut consumer = log.consumer("fresh-group");
        consumer.subscribe(&["events"]).unwrap();
        let records = consumer.poll(Duration::from_millis(10)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 0);
    }

    #[test]
    fn test_poll_times_out_empty() {
        let log = log_with_topic(1);
        let mut consumer = log.consumer("g1");
        consumer.subscribe(&["events"]).unwrap();
        let start = Instant::now();
        let records = consumer.poll(Duration::from_millis(20)).unwrap();
        assert!(records.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_poll_wakes_on_append() {
        let log = log_with_topic(1);
        let mut consumer = log.consumer("g1");
        consumer.subscribe(&["events"]).unwrap();

        let producer = log.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.produce("events", b"k", b"v", 0).unwrap();
        });

        let records = consumer.poll(Duration::from_secs(5)).unwrap();
        assert_eq!(records.len(), 1);
        handle.join().unwrap();
    }
}
