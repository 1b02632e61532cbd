//! Stream task executor.
//!
//! [`StreamExecutor`] drives records from a [`LogSource`] through a
//! finalized [`Topology`] in topological order, folding aggregates into
//! shared state stores and committing offsets in batches.
//!
//! # Commit protocol
//!
//! A batch closes after `max_batch_records` records or `commit_interval`,
//! whichever comes first. Closing a batch:
//!
//! 1. forwards collected sink entries to the log's producer side,
//! 2. flushes every store (durable stores sync their changelog here),
//! 3. writes a commit marker with the batch's offsets to every store,
//! 4. commits the offsets to the source.
//!
//! State durability always precedes the offset commit, so a crash between
//! steps is recovered by re-processing the uncommitted batch:
//! **at-least-once**, never exactly-once. Aggregation functions must be
//! written with replay in mind (an unkeyed running sum will double-count
//! a replayed batch).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fxhash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::{ErrorPolicy, RuntimeConfig};
use crate::record::{Record, StreamEntry};
use crate::source::{LogSink, LogSource, OffsetTracker, SourceError, TopicPartition};
use crate::state::{SharedStore, StateError, StoreRegistry};
use crate::topology::{NodeId, NodeKind, ProcessingError, Topology};
use crate::window::window_key;

/// Default poll timeout while waiting for records.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Errors from executor construction and record processing.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// An aggregate references a store missing from the registry.
    #[error("store '{store}' required by node '{node}' is not registered")]
    UnregisteredStore {
        /// Store name.
        store: String,
        /// Node that references it.
        node: String,
    },

    /// Log source failure.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// State store failure. Fatal; restart and replay.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// A user function failed under [`ErrorPolicy::FailFast`].
    #[error("record processing failed at node '{node}': {error}")]
    Processing {
        /// Node whose function failed.
        node: String,
        /// The user function's error.
        #[source]
        error: ProcessingError,
    },
}

/// Cooperative shutdown flag shared between the server and its executors.
///
/// Triggering stops record intake; the executor then drains its in-flight
/// batch, commits, and returns from [`StreamExecutor::run`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Executor tuning knobs, usually derived from [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Close a batch at least this often.
    pub commit_interval: Duration,
    /// Close a batch after at most this many records.
    pub max_batch_records: usize,
    /// What to do when a user function fails.
    pub error_policy: ErrorPolicy,
    /// How long a single poll waits for records.
    pub poll_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            commit_interval: Duration::from_millis(crate::config::DEFAULT_COMMIT_INTERVAL_MS),
            max_batch_records: crate::config::DEFAULT_MAX_BATCH_RECORDS,
            error_policy: ErrorPolicy::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl From<&RuntimeConfig> for ExecutorConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            commit_interval: config.commit_interval(),
            max_batch_records: config.max_batch_records,
            error_policy: config.error_policy,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Counters updated during processing, readable at any time.
#[derive(Debug, Clone, Default)]
pub struct ExecutorMetrics {
    /// Records pulled from the source and routed into the topology.
    pub records_processed: u64,
    /// Records dropped under [`ErrorPolicy::SkipAndLog`].
    pub records_skipped: u64,
    /// Batches flushed and committed.
    pub batches_committed: u64,
    /// Aggregate store upserts performed.
    pub aggregate_updates: u64,
    /// Entries forwarded to sink topics.
    pub sink_records: u64,
}

/// Per-partition processing state.
///
/// One task exists per assigned partition; partitions have disjoint key
/// spaces under the deterministic partitioner, so tasks never contend on
/// a key.
#[derive(Debug)]
struct StreamTask {
    tp: TopicPartition,
    /// Offset of the last record routed through the topology.
    last_processed: Option<i64>,
}

/// Drives one log source's assigned partitions through a topology.
///
/// Parallelism comes from running several executors, each with its own
/// source (and thus its own partition assignment); per-partition ordering
/// is preserved inside an executor by per-task routing.
pub struct StreamExecutor {
    topology: Arc<Topology>,
    source: Box<dyn LogSource>,
    registry: Arc<StoreRegistry>,
    /// Aggregate store handles resolved at construction, by node slot.
    node_stores: Vec<Option<SharedStore>>,
    sink: Option<Arc<dyn LogSink>>,
    config: ExecutorConfig,
    shutdown: ShutdownSignal,

    /// Per-node input queues, indexed by `NodeId.0`.
    queues: Vec<VecDeque<StreamEntry>>,
    /// Collected sink entries per node slot, forwarded at flush.
    sink_batches: Vec<Vec<StreamEntry>>,
    /// Per-partition tasks, created on subscribe.
    tasks: FxHashMap<TopicPartition, StreamTask>,
    /// Offsets processed but not yet committed.
    offsets: OffsetTracker,
    records_since_commit: usize,
    last_commit: Instant,
    started: bool,
    metrics: ExecutorMetrics,
}

impl StreamExecutor {
    /// Creates an executor over a finalized topology.
    ///
    /// Store handles for every aggregate node are resolved eagerly so a
    /// missing registration fails here rather than mid-stream.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::UnregisteredStore`] if an aggregate's
    /// store is not in the registry.
    pub fn new(
        topology: Arc<Topology>,
        source: Box<dyn LogSource>,
        registry: Arc<StoreRegistry>,
        sink: Option<Arc<dyn LogSink>>,
        config: ExecutorConfig,
        shutdown: ShutdownSignal,
    ) -> Result<Self, ExecutorError> {
        let slot_count = topology.slot_count();
        let mut node_stores: Vec<Option<SharedStore>> = vec![None; slot_count];

        for &node_id in topology.execution_order() {
            let node = topology.node(node_id).expect("node in execution order");
            if let NodeKind::Aggregate { store, .. } = &node.kind {
                let handle =
                    registry
                        .get(store)
                        .cloned()
                        .ok_or_else(|| ExecutorError::UnregisteredStore {
                            store: store.clone(),
                            node: node.name.clone(),
                        })?;
                node_stores[node_id.0 as usize] = Some(handle);
            }
        }

        Ok(Self {
            topology,
            source,
            registry,
            node_stores,
            sink,
            config,
            shutdown,
            queues: (0..slot_count).map(|_| VecDeque::new()).collect(),
            sink_batches: (0..slot_count).map(|_| Vec::new()).collect(),
            tasks: FxHashMap::default(),
            offsets: OffsetTracker::new(),
            records_since_commit: 0,
            last_commit: Instant::now(),
            started: false,
            metrics: ExecutorMetrics::default(),
        })
    }

    /// Subscribes to the topology's source topics and creates one task
    /// per assigned partition.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Source`] if the subscribe fails.
    pub fn start(&mut self) -> Result<Vec<TopicPartition>, ExecutorError> {
        let topics = self.topology.source_topics();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        let assignment = self.source.subscribe(&topic_refs)?;

        for tp in &assignment {
            self.tasks.insert(
                tp.clone(),
                StreamTask {
                    tp: tp.clone(),
                    last_processed: None,
                },
            );
        }
        info!(partitions = assignment.len(), "executor started");
        self.started = true;
        self.last_commit = Instant::now();
        Ok(assignment)
    }

    /// Runs the processing loop until shutdown is triggered, then drains
    /// the in-flight batch and commits.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; under [`ErrorPolicy::SkipAndLog`]
    /// user-function failures are not fatal.
    pub fn run(&mut self) -> Result<(), ExecutorError> {
        if !self.started {
            self.start()?;
        }

        while !self.shutdown.is_triggered() {
            self.poll_once()?;
            if self.should_commit() {
                self.flush_and_commit()?;
            }
        }

        // Shutdown: no new records; flush what is in flight, then release.
        self.flush_and_commit()?;
        info!("executor stopped");
        Ok(())
    }

    /// Polls once and processes the returned records.
    ///
    /// Returns the number of records processed. Exposed for tests and
    /// single-step drivers; [`run`](Self::run) is the production loop.
    ///
    /// # Errors
    ///
    /// Same contract as [`run`](Self::run).
    pub fn poll_once(&mut self) -> Result<usize, ExecutorError> {
        let records = self.source.poll(self.config.poll_timeout)?;
        let count = records.len();
        for record in records {
            self.process_record(record)?;
        }
        Ok(count)
    }

    /// Whether the current batch should be closed.
    #[must_use]
    pub fn should_commit(&self) -> bool {
        self.records_since_commit >= self.config.max_batch_records
            || (self.records_since_commit > 0
                && self.last_commit.elapsed() >= self.config.commit_interval)
    }

    /// Closes the current batch: sinks, store flush, commit markers,
    /// source offsets.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::State`] or [`ExecutorError::Source`] on
    /// failure; the batch is then re-processed after restart.
    pub fn flush_and_commit(&mut self) -> Result<(), ExecutorError> {
        if self.records_since_commit == 0 {
            self.last_commit = Instant::now();
            return Ok(());
        }

        self.forward_sinks()?;

        // State first, offsets second: the at-least-once boundary.
        self.registry.flush_all()?;
        self.registry.commit_all(&self.offsets.to_string_map())?;
        self.source.commit(&self.offsets.to_commit_map())?;

        debug!(
            records = self.records_since_commit,
            partitions = self.offsets.partition_count(),
            "batch committed"
        );
        self.records_since_commit = 0;
        self.last_commit = Instant::now();
        self.metrics.batches_committed += 1;
        Ok(())
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> &ExecutorMetrics {
        &self.metrics
    }

    /// The shutdown signal this executor observes.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Spawns the executor loop on a named worker thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a thread.
    pub fn spawn(mut self) -> std::thread::JoinHandle<Result<(), ExecutorError>> {
        std::thread::Builder::new()
            .name("freshet-executor".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn executor thread")
    }

    // ---- Record processing ----

    /// Routes one record through the topology.
    fn process_record(&mut self, record: Record) -> Result<(), ExecutorError> {
        let tp = TopicPartition::new(record.topic.clone(), record.partition);
        let offset = record.offset;

        let sources = self.topology.sources_for_topic(&record.topic).to_vec();
        if sources.is_empty() {
            // Subscribed topics and topology sources are built from the
            // same set; a miss here means the record is stale.
            warn!(topic = %record.topic, "record for topic with no source node");
            return Ok(());
        }

        let entry = record.into_entry();
        for &source_id in &sources {
            self.queues[source_id.0 as usize].push_back(entry.clone());
        }
        self.drain_queues()?;

        if let Some(task) = self.tasks.get_mut(&tp) {
            // Ordering is total within a partition; the source must never
            // hand a task an offset at or before one it has processed.
            debug_assert!(
                task.last_processed.map_or(true, |last| offset > last),
                "out-of-order record for {tp}: offset {offset}"
            );
            task.last_processed = Some(offset);
            self.offsets.update(&task.tp, offset);
        } else {
            // Record from a partition outside the assignment; track it
            // anyway so its offset is not lost on commit.
            self.tasks.insert(
                tp.clone(),
                StreamTask {
                    tp: tp.clone(),
                    last_processed: Some(offset),
                },
            );
            self.offsets.update(&tp, offset);
        }

        self.records_since_commit += 1;
        self.metrics.records_processed += 1;
        Ok(())
    }

    /// Processes all nodes in topological order until queues are empty.
    fn drain_queues(&mut self) -> Result<(), ExecutorError> {
        for i in 0..self.topology.execution_order().len() {
            let node_id = self.topology.execution_order()[i];
            self.process_node(node_id)?;
        }
        Ok(())
    }

    /// Drains one node's input queue through its function.
    fn process_node(&mut self, node_id: NodeId) -> Result<(), ExecutorError> {
        let idx = node_id.0 as usize;
        if self.queues[idx].is_empty() {
            return Ok(());
        }

        let topology = Arc::clone(&self.topology);
        let node = topology.node(node_id).expect("node in execution order");

        while let Some(entry) = self.queues[idx].pop_front() {
            match &node.kind {
                NodeKind::Source { .. } => {
                    self.emit(node_id, entry);
                }
                NodeKind::Transform { func } => match func(&entry) {
                    Ok(outputs) => {
                        for output in outputs {
                            self.emit(node_id, output);
                        }
                    }
                    Err(error) => self.handle_user_error(&node.name, error)?,
                },
                NodeKind::GroupBy { selector } => match selector(&entry) {
                    Ok(key) => self.emit(node_id, entry.with_key(key)),
                    Err(error) => self.handle_user_error(&node.name, error)?,
                },
                NodeKind::Aggregate {
                    init,
                    agg,
                    windows,
                    ..
                } => {
                    let store = self.node_stores[idx]
                        .clone()
                        .expect("aggregate store resolved at construction");
                    self.apply_aggregate(node_id, &node.name, &store, init, agg, *windows, &entry)?;
                }
                NodeKind::Sink { .. } => {
                    self.sink_batches[idx].push(entry);
                }
            }
        }
        Ok(())
    }

    /// Folds one entry into an aggregate store and emits the updated pair.
    #[allow(clippy::too_many_arguments)]
    fn apply_aggregate(
        &mut self,
        node_id: NodeId,
        node_name: &str,
        store: &SharedStore,
        init: &crate::topology::InitFn,
        agg: &crate::topology::AggregateFn,
        windows: Option<crate::window::WindowSpec>,
        entry: &StreamEntry,
    ) -> Result<(), ExecutorError> {
        let store_keys: Vec<Vec<u8>> = match windows {
            None => vec![entry.key.to_vec()],
            Some(spec) => spec
                .windows_for(entry.timestamp)
                .iter()
                .map(|&start| window_key(&entry.key, start))
                .collect(),
        };

        for store_key in store_keys {
            let updated = {
                let mut guard = store.write();
                let current = guard.get(&store_key).unwrap_or_else(|| init());
                // The fold sees the group key; windowed encoding is a
                // storage concern only.
                match agg(&entry.key, &entry.value, &current) {
                    Ok(new_value) => {
                        guard.put(&store_key, &new_value)?;
                        Some(new_value)
                    }
                    Err(error) => {
                        drop(guard);
                        self.handle_user_error(node_name, error)?;
                        None
                    }
                }
            };

            if let Some(new_value) = updated {
                self.metrics.aggregate_updates += 1;
                self.emit(
                    node_id,
                    StreamEntry {
                        key: Bytes::from(store_key),
                        value: new_value,
                        timestamp: entry.timestamp,
                    },
                );
            }
        }
        Ok(())
    }

    /// Enqueues an entry at every child of `node_id`.
    fn emit(&mut self, node_id: NodeId, entry: StreamEntry) {
        let node = self.topology.node(node_id).expect("node in execution order");
        let children = node.children.clone();
        match children.split_last() {
            None => {}
            Some((&last, rest)) => {
                for &child in rest {
                    self.queues[child.0 as usize].push_back(entry.clone());
                }
                self.queues[last.0 as usize].push_back(entry);
            }
        }
    }

    /// Applies the configured error policy to a user-function failure.
    fn handle_user_error(
        &mut self,
        node: &str,
        error: ProcessingError,
    ) -> Result<(), ExecutorError> {
        match self.config.error_policy {
            ErrorPolicy::SkipAndLog => {
                warn!(node, error = %error, "record processing failed, skipping");
                self.metrics.records_skipped += 1;
                Ok(())
            }
            ErrorPolicy::FailFast => Err(ExecutorError::Processing {
                node: node.to_string(),
                error,
            }),
        }
    }

    /// Forwards collected sink entries to the log's producer side.
    fn forward_sinks(&mut self) -> Result<(), ExecutorError> {
        let Some(sink) = self.sink.clone() else {
            for batch in &mut self.sink_batches {
                batch.clear();
            }
            return Ok(());
        };

        for (idx, batch) in self.sink_batches.iter_mut().enumerate() {
            if batch.is_empty() {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let node_id = NodeId(idx as u32);
            let Some(node) = self.topology.node(node_id) else {
                batch.clear();
                continue;
            };
            if let NodeKind::Sink { topic } = &node.kind {
                for entry in batch.drain(..) {
                    sink.produce(topic, &entry.key, &entry.value, entry.timestamp)?;
                    self.metrics.sink_records += 1;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamExecutor")
            .field("tasks", &self.tasks.len())
            .field("records_since_commit", &self.records_since_commit)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
