//! Unit tests for topology construction and validation.

use std::sync::Arc;

use bytes::Bytes;

use super::builder::identity_key_selector;
use super::error::TopologyError;
use super::graph::Topology;
use super::{AggregateFn, InitFn, NodeKind, TopologyBuilder, TransformFn};

fn noop_transform() -> TransformFn {
    Arc::new(|entry| Ok(vec![entry.clone()]))
}

fn init_zero() -> InitFn {
    Arc::new(Bytes::new)
}

fn keep_current() -> AggregateFn {
    Arc::new(|_k, _v, current| Ok(Bytes::copy_from_slice(current)))
}

/// source -> transform -> group-by -> aggregate -> sink
fn linear_topology() -> Topology {
    let mut builder = TopologyBuilder::new();
    builder.add_store("totals");
    let src = builder.add_source("src", "commits");
    let parsed = builder.add_transform("parse", &[src], noop_transform());
    let agg = builder.add_keyed_aggregate(
        "sum",
        parsed,
        identity_key_selector(),
        init_zero(),
        keep_current(),
        "totals",
    );
    builder.add_sink("out", agg, "totals-changes");
    builder.build().unwrap()
}

#[test]
fn test_linear_build() {
    let topology = linear_topology();
    assert!(topology.is_finalized());
    assert_eq!(topology.node_count(), 5);
    assert_eq!(topology.store_names(), vec!["totals".to_string()]);
    assert_eq!(topology.source_topics(), vec!["commits".to_string()]);
}

#[test]
fn test_execution_order_respects_edges() {
    let topology = linear_topology();
    let order = topology.execution_order();
    assert_eq!(order.len(), 5);

    let position = |name: &str| {
        let id = topology.node_id_by_name(name).unwrap();
        order.iter().position(|&n| n == id).unwrap()
    };
    assert!(position("src") < position("parse"));
    assert!(position("parse") < position("sum-keys"));
    assert!(position("sum-keys") < position("sum"));
    assert!(position("sum") < position("out"));
}

#[test]
fn test_sources_indexed_by_topic() {
    let topology = linear_topology();
    let sources = topology.sources_for_topic("commits");
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0], topology.node_id_by_name("src").unwrap());
    assert!(topology.sources_for_topic("unknown").is_empty());
}

#[test]
fn test_keyed_aggregate_inserts_group_by() {
    let topology = linear_topology();
    let keys_id = topology.node_id_by_name("sum-keys").unwrap();
    let node = topology.node(keys_id).unwrap();
    assert!(matches!(node.kind, NodeKind::GroupBy { .. }));

    let agg_id = topology.node_id_by_name("sum").unwrap();
    assert_eq!(topology.node(agg_id).unwrap().parents.as_slice(), &[keys_id]);
}

#[test]
fn test_fan_out_to_multiple_aggregates() {
    let mut builder = TopologyBuilder::new();
    builder.add_store("a").add_store("b");
    let src = builder.add_source("src", "events");
    builder.add_aggregate("agg-a", src, init_zero(), keep_current(), "a");
    builder.add_aggregate("agg-b", src, init_zero(), keep_current(), "b");
    let topology = builder.build().unwrap();

    let src_id = topology.node_id_by_name("src").unwrap();
    assert_eq!(topology.node(src_id).unwrap().children.len(), 2);
}

#[test]
fn test_empty_topology_rejected() {
    let builder = TopologyBuilder::new();
    assert!(matches!(
        builder.build(),
        Err(TopologyError::EmptyTopology)
    ));
}

#[test]
fn test_duplicate_node_name_rejected() {
    let mut builder = TopologyBuilder::new();
    builder.add_source("src", "a");
    builder.add_source("src", "b");
    assert!(matches!(
        builder.build(),
        Err(TopologyError::DuplicateNode(name)) if name == "src"
    ));
}

#[test]
fn test_undeclared_store_rejected() {
    let mut builder = TopologyBuilder::new();
    let src = builder.add_source("src", "events");
    builder.add_aggregate("agg", src, init_zero(), keep_current(), "never-declared");
    assert!(matches!(
        builder.build(),
        Err(TopologyError::UnknownStore { store, node })
            if store == "never-declared" && node == "agg"
    ));
}

#[test]
fn test_cycle_rejected() {
    // The handle-based builder cannot express a cycle, so build the graph
    // directly.
    let mut topology = Topology::new();
    let a = topology
        .add_node("a", NodeKind::Transform { func: noop_transform() })
        .unwrap();
    let b = topology
        .add_node("b", NodeKind::Transform { func: noop_transform() })
        .unwrap();
    topology.add_edge(a, b).unwrap();
    topology.add_edge(b, a).unwrap();

    assert!(matches!(
        topology.finalize(),
        Err(TopologyError::CycleDetected(_))
    ));
}

#[test]
fn test_self_loop_rejected_at_edge_insert() {
    let mut topology = Topology::new();
    let a = topology
        .add_node("a", NodeKind::Transform { func: noop_transform() })
        .unwrap();
    assert!(matches!(
        topology.add_edge(a, a),
        Err(TopologyError::CycleDetected(name)) if name == "a"
    ));
}

#[test]
fn test_edge_to_missing_node_rejected() {
    let mut topology = Topology::new();
    let a = topology
        .add_node("a", NodeKind::Source { topic: "t".into() })
        .unwrap();
    let ghost = super::NodeId(99);
    assert!(matches!(
        topology.add_edge(a, ghost),
        Err(TopologyError::NodeNotFound(_))
    ));
}

#[test]
fn test_disconnected_non_source_rejected() {
    let mut topology = Topology::new();
    topology
        .add_node("src", NodeKind::Source { topic: "t".into() })
        .unwrap();
    topology
        .add_node("floating", NodeKind::Transform { func: noop_transform() })
        .unwrap();
    assert!(matches!(
        topology.finalize(),
        Err(TopologyError::DisconnectedNode(name)) if name == "floating"
    ));
}

#[test]
fn test_building_is_declarative() {
    // Functions registered at build time must not run during build.
    let mut builder = TopologyBuilder::new();
    let src = builder.add_source("src", "events");
    let exploding: TransformFn = Arc::new(|_| panic!("transform ran during build"));
    builder.add_transform("boom", &[src], exploding);
    let topology = builder.build().unwrap();
    assert_eq!(topology.node_count(), 2);
}

#[test]
fn test_multiple_parents_for_transform() {
    let mut builder = TopologyBuilder::new();
    let a = builder.add_source("src-a", "topic-a");
    let b = builder.add_source("src-b", "topic-b");
    let merged = builder.add_transform("merge", &[a, b], noop_transform());
    let topology = builder.build().unwrap();

    let merged_id = topology.node_id_by_name("merge").unwrap();
    assert_eq!(topology.node(merged_id).unwrap().parents.len(), 2);
    assert_eq!(merged, merged_id);
}
