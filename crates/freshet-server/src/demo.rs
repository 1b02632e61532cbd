//! Built-in demo pipeline.
//!
//! Aggregates commit-message lengths per author from the `commits` topic:
//! a running total in `commit-message-totals`, optionally a windowed
//! variant, and a changelog-style output topic with every update. Seeded
//! with a few records so queries answer immediately after startup.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use freshet_core::source::{InMemoryLog, LogSink};
use freshet_core::topology::{
    identity_key_selector, AggregateFn, InitFn, Topology, TopologyBuilder, TopologyError,
};
use freshet_core::window::WindowSpec;
use freshet_core::RuntimeConfig;

/// Input topic of commit messages, keyed by author.
pub const COMMITS_TOPIC: &str = "commits";
/// Output topic carrying every aggregate update.
pub const TOTALS_TOPIC: &str = "commit-message-totals-changes";
/// Running total store.
pub const TOTALS_STORE: &str = "commit-message-totals";
/// Windowed total store (present when a window size is configured).
pub const WINDOWED_TOTALS_STORE: &str = "commit-message-totals-windowed";

/// Partitions for the demo topics.
const PARTITIONS: usize = 4;

fn init_zero() -> InitFn {
    Arc::new(|| Bytes::copy_from_slice(&0u64.to_le_bytes()))
}

/// Adds the message length to the author's running total.
///
/// Totals are u64 little-endian. The fold is a plain running sum with no
/// dedup key: NOT idempotent under at-least-once replay, so a replayed
/// batch double-counts.
fn add_message_length() -> AggregateFn {
    Arc::new(|_author, message, current| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(current);
        let total = u64::from_le_bytes(buf) + message.len() as u64;
        Ok(Bytes::copy_from_slice(&total.to_le_bytes()))
    })
}

/// Builds the demo topology.
///
/// # Errors
///
/// Returns a [`TopologyError`] if the graph fails validation.
pub fn build_topology(config: &RuntimeConfig) -> Result<Topology, TopologyError> {
    let mut builder = TopologyBuilder::new();
    builder.add_store(TOTALS_STORE);

    let commits = builder.add_source("commit-source", COMMITS_TOPIC);
    let totals = builder.add_keyed_aggregate(
        "total-by-author",
        commits,
        identity_key_selector(),
        init_zero(),
        add_message_length(),
        TOTALS_STORE,
    );
    builder.add_sink("totals-changes", totals, TOTALS_TOPIC);

    if let Some(size_ms) = config.window_size_ms {
        let size = Duration::from_millis(size_ms);
        let advance = config
            .window_advance_ms
            .map_or(size, Duration::from_millis);
        builder.add_store(WINDOWED_TOTALS_STORE);
        builder.add_windowed_aggregate(
            "windowed-total-by-author",
            commits,
            init_zero(),
            add_message_length(),
            WINDOWED_TOTALS_STORE,
            WindowSpec::hopping(size, advance),
        );
    }

    builder.build()
}

/// Creates the demo topics on a fresh log.
pub fn create_topics(log: &InMemoryLog) {
    log.create_topic(COMMITS_TOPIC, PARTITIONS);
    log.create_topic(TOTALS_TOPIC, PARTITIONS);
}

/// Seeds a handful of commit messages so queries have data to answer.
///
/// # Errors
///
/// Returns a source error if a topic is missing.
pub fn seed_records(log: &InMemoryLog) -> Result<(), freshet_core::source::SourceError> {
    let now = 1_700_000_000_000i64;
    let commits: &[(&str, &str)] = &[
        ("alice", "fix bug"),
        ("alice", "ok"),
        ("bob", "hi"),
        ("carol", "refactor state store range scans"),
        ("bob", "bump deps"),
        ("alice", "add interactive query endpoint"),
    ];
    for (i, (author, message)) in commits.iter().enumerate() {
        log.produce(
            COMMITS_TOPIC,
            author.as_bytes(),
            message.as_bytes(),
            now + i as i64 * 1_000,
        )?;
    }
    Ok(())
}
