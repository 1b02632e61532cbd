//! Unit tests for the stream executor: aggregation folding, batch
//! boundaries, at-least-once replay, error policy, sinks, windows, and
//! shutdown draining.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::ErrorPolicy;
use crate::source::{InMemoryLog, LogSink, LogSource, TopicPartition};
use crate::state::{InMemoryStore, SharedStore, StoreRegistry};
use crate::topology::{
    identity_key_selector, AggregateFn, InitFn, Topology, TopologyBuilder, TransformFn,
};
use crate::window::{window_key, WindowSpec};

use super::{ExecutorConfig, ShutdownSignal, StreamExecutor};

fn init_zero() -> InitFn {
    Arc::new(|| Bytes::copy_from_slice(&0u64.to_le_bytes()))
}

/// Sums the value lengths per key. Not idempotent under replay, which is
/// exactly what the replay test asserts.
fn add_value_len() -> AggregateFn {
    Arc::new(|_key, value, current| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(current);
        let sum = u64::from_le_bytes(buf) + value.len() as u64;
        Ok(Bytes::copy_from_slice(&sum.to_le_bytes()))
    })
}

fn read_u64(store: &SharedStore, key: &[u8]) -> Option<u64> {
    store
        .get(key, crate::config::ReplayPolicy::Fail)
        .unwrap()
        .map(|bytes| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes);
            u64::from_le_bytes(buf)
        })
}

/// Source "commits" -> length-sum aggregate into "totals".
fn length_sum_topology() -> Arc<Topology> {
    let mut builder = TopologyBuilder::new();
    builder.add_store("totals");
    let src = builder.add_source("commit-source", "commits");
    builder.add_keyed_aggregate(
        "sum-by-author",
        src,
        identity_key_selector(),
        init_zero(),
        add_value_len(),
        "totals",
    );
    Arc::new(builder.build().unwrap())
}

fn registry_for(topology: &Topology) -> Arc<StoreRegistry> {
    let mut registry = StoreRegistry::new();
    for name in topology.store_names() {
        registry.register(SharedStore::new(name, Box::new(InMemoryStore::new())));
    }
    Arc::new(registry)
}

fn executor(
    topology: &Arc<Topology>,
    log: &InMemoryLog,
    registry: &Arc<StoreRegistry>,
    group: &str,
    config: ExecutorConfig,
) -> StreamExecutor {
    StreamExecutor::new(
        Arc::clone(topology),
        Box::new(log.consumer(group)),
        Arc::clone(registry),
        Some(Arc::new(log.clone())),
        config,
        ShutdownSignal::new(),
    )
    .unwrap()
}

fn drain(exec: &mut StreamExecutor) {
    // Poll until the source runs dry, then close the batch.
    while exec.poll_once().unwrap() > 0 {}
    exec.flush_and_commit().unwrap();
}

#[test]
fn test_length_sum_scenario() {
    let topology = length_sum_topology();
    let log = InMemoryLog::new();
    log.create_topic("commits", 4);
    log.produce("commits", b"alice", b"fix bug", 1).unwrap();
    log.produce("commits", b"alice", b"ok", 2).unwrap();
    log.produce("commits", b"bob", b"hi", 3).unwrap();

    let registry = registry_for(&topology);
    let mut exec = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    exec.start().unwrap();
    drain(&mut exec);

    let totals = registry.get("totals").unwrap();
    assert_eq!(read_u64(totals, b"alice"), Some(9));
    assert_eq!(read_u64(totals, b"bob"), Some(2));
    assert_eq!(read_u64(totals, b"carol"), None);
}

#[test]
fn test_fold_order_matches_partition_order() {
    // agg appends the value's first byte, exposing processing order.
    let topology = {
        let mut builder = TopologyBuilder::new();
        builder.add_store("trace");
        let src = builder.add_source("src", "events");
        let concat: AggregateFn = Arc::new(|_k, value, current| {
            let mut out = current.to_vec();
            out.push(value[0]);
            Ok(Bytes::from(out))
        });
        builder.add_aggregate("concat", src, Arc::new(Bytes::new), concat, "trace");
        Arc::new(builder.build().unwrap())
    };

    let log = InMemoryLog::new();
    log.create_topic("events", 1);
    for b in [b"1", b"2", b"3", b"4"] {
        log.produce("events", b"k", b, 0).unwrap();
    }

    let registry = registry_for(&topology);
    let mut exec = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    exec.start().unwrap();
    drain(&mut exec);

    let value = registry
        .get("trace")
        .unwrap()
        .get(b"k", crate::config::ReplayPolicy::Fail)
        .unwrap()
        .unwrap();
    assert_eq!(value.as_ref(), b"1234");
}

#[test]
fn test_batch_boundaries_do_not_change_result() {
    let messages: Vec<(&[u8], &[u8])> = vec![
        (b"alice", b"one"),
        (b"bob", b"twotwo"),
        (b"alice", b"three"),
        (b"bob", b"x"),
        (b"carol", b"yy"),
    ];

    let run_with_batch_size = |max_batch_records: usize| {
        let topology = length_sum_topology();
        let log = InMemoryLog::new();
        log.create_topic("commits", 2);
        for (key, value) in &messages {
            log.produce("commits", key, value, 0).unwrap();
        }
        let registry = registry_for(&topology);
        let config = ExecutorConfig {
            max_batch_records,
            ..ExecutorConfig::default()
        };
        let mut exec = executor(&topology, &log, &registry, "g", config);
        exec.start().unwrap();
        // Commit after every poll to force many small batches.
        while exec.poll_once().unwrap() > 0 {
            exec.flush_and_commit().unwrap();
        }
        exec.flush_and_commit().unwrap();
        let totals = registry.get("totals").unwrap();
        (
            read_u64(totals, b"alice"),
            read_u64(totals, b"bob"),
            read_u64(totals, b"carol"),
        )
    };

    assert_eq!(run_with_batch_size(1), run_with_batch_size(100));
    assert_eq!(run_with_batch_size(1), (Some(8), Some(7), Some(2)));
}

#[test]
fn test_replay_of_uncommitted_batch_double_counts() {
    // Crash before offset commit: the batch replays against surviving
    // state. The length-sum fold is not idempotent, so the totals double.
    // This is the documented at-least-once caveat, not a bug in the test.
    let topology = length_sum_topology();
    let log = InMemoryLog::new();
    log.create_topic("commits", 1);
    log.produce("commits", b"alice", b"fix bug", 1).unwrap();
    log.produce("commits", b"alice", b"ok", 2).unwrap();

    let registry = registry_for(&topology);

    // First pass processes the batch but "crashes" before commit.
    let mut first = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    first.start().unwrap();
    while first.poll_once().unwrap() > 0 {}
    drop(first); // no flush_and_commit

    let totals = registry.get("totals").unwrap();
    assert_eq!(read_u64(totals, b"alice"), Some(9));

    // Restarted executor resumes from the last committed offset (none),
    // replaying the whole batch into the surviving state.
    let mut second = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    second.start().unwrap();
    drain(&mut second);

    assert_eq!(read_u64(totals, b"alice"), Some(18));
}

#[test]
fn test_committed_batch_is_not_reprocessed() {
    let topology = length_sum_topology();
    let log = InMemoryLog::new();
    log.create_topic("commits", 1);
    log.produce("commits", b"alice", b"fix bug", 1).unwrap();

    let registry = registry_for(&topology);
    let mut first = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    first.start().unwrap();
    drain(&mut first);
    drop(first);

    let tp = TopicPartition::new("commits", 0);
    assert_eq!(log.committed_offset("g", &tp), Some(1));

    let mut second = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    second.start().unwrap();
    drain(&mut second);

    let totals = registry.get("totals").unwrap();
    assert_eq!(read_u64(totals, b"alice"), Some(7));
}

#[test]
fn test_transform_flat_map() {
    // Split values on spaces and count occurrences per word.
    let topology = {
        let mut builder = TopologyBuilder::new();
        builder.add_store("word-counts");
        let src = builder.add_source("lines", "text-lines");
        let split: TransformFn = Arc::new(|entry| {
            let text = String::from_utf8_lossy(&entry.value).to_lowercase();
            Ok(text
                .split_whitespace()
                .map(|word| crate::record::StreamEntry::new(
                    word.as_bytes().to_vec(),
                    &b""[..],
                    entry.timestamp,
                ))
                .collect())
        });
        let words = builder.add_transform("split-words", &[src], split);
        let count: AggregateFn = Arc::new(|_k, _v, current| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(current);
            Ok(Bytes::copy_from_slice(
                &(u64::from_le_bytes(buf) + 1).to_le_bytes(),
            ))
        });
        builder.add_keyed_aggregate(
            "count-words",
            words,
            identity_key_selector(),
            init_zero(),
            count,
            "word-counts",
        );
        Arc::new(builder.build().unwrap())
    };

    let log = InMemoryLog::new();
    log.create_topic("text-lines", 1);
    log.produce("text-lines", b"1", b"hello streaming world", 0)
        .unwrap();
    log.produce("text-lines", b"2", b"hello again", 0).unwrap();

    let registry = registry_for(&topology);
    let mut exec = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    exec.start().unwrap();
    drain(&mut exec);

    let counts = registry.get("word-counts").unwrap();
    assert_eq!(read_u64(counts, b"hello"), Some(2));
    assert_eq!(read_u64(counts, b"streaming"), Some(1));
    assert_eq!(read_u64(counts, b"again"), Some(1));
}

#[test]
fn test_error_policy_skip_and_log() {
    let topology = {
        let mut builder = TopologyBuilder::new();
        builder.add_store("totals");
        let src = builder.add_source("src", "commits");
        let fallible: TransformFn = Arc::new(|entry| {
            if entry.value.as_ref() == b"poison" {
                Err("unparseable record".into())
            } else {
                Ok(vec![entry.clone()])
            }
        });
        let parsed = builder.add_transform("parse", &[src], fallible);
        builder.add_keyed_aggregate(
            "sum",
            parsed,
            identity_key_selector(),
            init_zero(),
            add_value_len(),
            "totals",
        );
        Arc::new(builder.build().unwrap())
    };

    let log = InMemoryLog::new();
    log.create_topic("commits", 1);
    log.produce("commits", b"alice", b"ok", 0).unwrap();
    log.produce("commits", b"alice", b"poison", 0).unwrap();
    log.produce("commits", b"alice", b"yes", 0).unwrap();

    let registry = registry_for(&topology);
    let mut exec = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    exec.start().unwrap();
    drain(&mut exec);

    // Poison record skipped, the rest folded.
    assert_eq!(read_u64(registry.get("totals").unwrap(), b"alice"), Some(5));
    assert_eq!(exec.metrics().records_skipped, 1);
    assert_eq!(exec.metrics().records_processed, 3);
}

#[test]
fn test_error_policy_fail_fast() {
    let topology = {
        let mut builder = TopologyBuilder::new();
        builder.add_store("totals");
        let src = builder.add_source("src", "commits");
        let poisoned: TransformFn = Arc::new(|_| Err("boom".into()));
        let parsed = builder.add_transform("parse", &[src], poisoned);
        builder.add_keyed_aggregate(
            "sum",
            parsed,
            identity_key_selector(),
            init_zero(),
            add_value_len(),
            "totals",
        );
        Arc::new(builder.build().unwrap())
    };

    let log = InMemoryLog::new();
    log.create_topic("commits", 1);
    log.produce("commits", b"k", b"v", 0).unwrap();

    let registry = registry_for(&topology);
    let config = ExecutorConfig {
        error_policy: ErrorPolicy::FailFast,
        ..ExecutorConfig::default()
    };
    let mut exec = executor(&topology, &log, &registry, "g", config);
    exec.start().unwrap();

    let err = exec.poll_once().unwrap_err();
    assert!(matches!(
        err,
        super::ExecutorError::Processing { node, .. } if node == "parse"
    ));
}

#[test]
fn test_sink_receives_aggregate_updates() {
    let topology = {
        let mut builder = TopologyBuilder::new();
        builder.add_store("totals");
        let src = builder.add_source("src", "commits");
        let agg = builder.add_keyed_aggregate(
            "sum",
            src,
            identity_key_selector(),
            init_zero(),
            add_value_len(),
            "totals",
        );
        builder.add_sink("changes", agg, "totals-changes");
        Arc::new(builder.build().unwrap())
    };

    let log = InMemoryLog::new();
    log.create_topic("commits", 1);
    log.create_topic("totals-changes", 1);
    log.produce("commits", b"alice", b"fix bug", 0).unwrap();
    log.produce("commits", b"alice", b"ok", 0).unwrap();

    let registry = registry_for(&topology);
    let mut exec = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    exec.start().unwrap();
    drain(&mut exec);

    // One update per input record, in order: 7 then 9.
    let mut consumer = log.consumer("sink-reader");
    consumer.subscribe(&["totals-changes"]).unwrap();
    let updates = consumer.poll(Duration::from_millis(10)).unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].key.as_ref(), b"alice");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&updates[0].value);
    assert_eq!(u64::from_le_bytes(buf), 7);
    buf.copy_from_slice(&updates[1].value);
    assert_eq!(u64::from_le_bytes(buf), 9);
}

#[test]
fn test_windowed_aggregate_updates_overlapping_windows() {
    let spec = WindowSpec::hopping(Duration::from_secs(10), Duration::from_secs(5));
    let topology = {
        let mut builder = TopologyBuilder::new();
        builder.add_store("windowed-totals");
        let src = builder.add_source("src", "commits");
        builder.add_windowed_aggregate(
            "windowed-sum",
            src,
            init_zero(),
            add_value_len(),
            "windowed-totals",
            spec,
        );
        Arc::new(builder.build().unwrap())
    };

    let log = InMemoryLog::new();
    log.create_topic("commits", 1);
    // t=12s falls in windows [5s,15s) and [10s,20s).
    log.produce("commits", b"alice", b"abc", 12_000).unwrap();

    let registry = registry_for(&topology);
    let mut exec = executor(&topology, &log, &registry, "g", ExecutorConfig::default());
    exec.start().unwrap();
    drain(&mut exec);

    let store = registry.get("windowed-totals").unwrap();
    let w1 = window_key(b"alice", 5_000);
    let w2 = window_key(b"alice", 10_000);
    assert_eq!(read_u64(store, &w1), Some(3));
    assert_eq!(read_u64(store, &w2), Some(3));
    assert_eq!(read_u64(store, &window_key(b"alice", 0)), None);
}

#[test]
fn test_shutdown_drains_and_commits() {
    let topology = length_sum_topology();
    let log = InMemoryLog::new();
    log.create_topic("commits", 1);
    for _ in 0..10 {
        log.produce("commits", b"alice", b"x", 0).unwrap();
    }

    let registry = registry_for(&topology);
    // Long commit interval: without the shutdown drain nothing would commit.
    let config = ExecutorConfig {
        commit_interval: Duration::from_secs(3600),
        max_batch_records: 1_000_000,
        ..ExecutorConfig::default()
    };
    let exec = executor(&topology, &log, &registry, "g", config);
    let shutdown = exec.shutdown_signal();
    let handle = exec.spawn();

    // Give the loop time to consume, then stop it.
    std::thread::sleep(Duration::from_millis(100));
    shutdown.trigger();
    handle.join().unwrap().unwrap();

    assert_eq!(read_u64(registry.get("totals").unwrap(), b"alice"), Some(10));
    let tp = TopicPartition::new("commits", 0);
    assert_eq!(log.committed_offset("g", &tp), Some(10));
}

#[test]
fn test_unregistered_store_fails_at_construction() {
    let topology = length_sum_topology();
    let log = InMemoryLog::new();
    log.create_topic("commits", 1);

    let err = StreamExecutor::new(
        Arc::clone(&topology),
        Box::new(log.consumer("g")),
        Arc::new(StoreRegistry::new()),
        None,
        ExecutorConfig::default(),
        ShutdownSignal::new(),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        super::ExecutorError::UnregisteredStore { store, .. } if store == "totals"
    ));
}
