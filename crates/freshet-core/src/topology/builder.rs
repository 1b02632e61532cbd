//! Handle-based builder for programmatic topology construction.
//!
//! Building is purely declarative: no record flows until an executor is
//! started with the finished [`Topology`].

use bytes::Bytes;

use crate::window::WindowSpec;

use super::error::TopologyError;
use super::graph::Topology;
use super::{AggregateFn, InitFn, KeySelectorFn, NodeHandle, NodeKind, TransformFn};

/// One node definition collected by the builder.
struct NodeDef {
    name: String,
    kind: NodeKind,
    parents: Vec<NodeHandle>,
}

/// Builder for [`Topology`] graphs.
///
/// Methods return a [`NodeHandle`] used to wire downstream nodes. Handles
/// are only valid with the builder that produced them.
///
/// # Example
///
/// ```rust,ignore
/// let mut builder = TopologyBuilder::new();
/// builder.add_store("totals");
/// let src = builder.add_source("commits", "commit-log");
/// let agg = builder.add_aggregate("sum", src, init_zero, add_len, "totals");
/// builder.add_sink("out", agg, "totals-changes");
/// let topology = builder.build()?;
/// ```
pub struct TopologyBuilder {
    nodes: Vec<NodeDef>,
    stores: Vec<String>,
}

impl TopologyBuilder {
    /// Creates a new topology builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            stores: Vec::new(),
        }
    }

    /// Declares a state store that aggregate nodes may reference.
    pub fn add_store(&mut self, name: &str) -> &mut Self {
        self.stores.push(name.to_string());
        self
    }

    /// Adds a source node reading from `topic`.
    pub fn add_source(&mut self, name: &str, topic: &str) -> NodeHandle {
        self.push(
            name,
            NodeKind::Source {
                topic: topic.to_string(),
            },
            Vec::new(),
        )
    }

    /// Adds a stateless flat-map transform downstream of `parents`.
    pub fn add_transform(
        &mut self,
        name: &str,
        parents: &[NodeHandle],
        func: TransformFn,
    ) -> NodeHandle {
        self.push(name, NodeKind::Transform { func }, parents.to_vec())
    }

    /// Adds a group-by node that re-keys entries via `selector`.
    pub fn add_group_by(
        &mut self,
        name: &str,
        parent: NodeHandle,
        selector: KeySelectorFn,
    ) -> NodeHandle {
        self.push(name, NodeKind::GroupBy { selector }, vec![parent])
    }

    /// Adds an aggregate folding entries into `store`, grouped by the
    /// entries' current key.
    pub fn add_aggregate(
        &mut self,
        name: &str,
        parent: NodeHandle,
        init: InitFn,
        agg: AggregateFn,
        store: &str,
    ) -> NodeHandle {
        self.push(
            name,
            NodeKind::Aggregate {
                init,
                agg,
                store: store.to_string(),
                windows: None,
            },
            vec![parent],
        )
    }

    /// Adds a group-by followed by an aggregate in one step.
    ///
    /// The inserted group-by node is named `{name}-keys`.
    pub fn add_keyed_aggregate(
        &mut self,
        name: &str,
        parent: NodeHandle,
        selector: KeySelectorFn,
        init: InitFn,
        agg: AggregateFn,
        store: &str,
    ) -> NodeHandle {
        let keys = self.add_group_by(&format!("{name}-keys"), parent, selector);
        self.add_aggregate(name, keys, init, agg, store)
    }

    /// Adds a windowed aggregate.
    ///
    /// Each entry is folded into every window its timestamp falls in; store
    /// keys are `group_key ++ 0x00 ++ window_start` (see
    /// [`window_key`](crate::window::window_key)).
    pub fn add_windowed_aggregate(
        &mut self,
        name: &str,
        parent: NodeHandle,
        init: InitFn,
        agg: AggregateFn,
        store: &str,
        windows: WindowSpec,
    ) -> NodeHandle {
        self.push(
            name,
            NodeKind::Aggregate {
                init,
                agg,
                store: store.to_string(),
                windows: Some(windows),
            },
            vec![parent],
        )
    }

    /// Adds a sink writing entries to `topic`.
    pub fn add_sink(&mut self, name: &str, parent: NodeHandle, topic: &str) -> NodeHandle {
        self.push(
            name,
            NodeKind::Sink {
                topic: topic.to_string(),
            },
            vec![parent],
        )
    }

    /// Builds and validates the topology.
    ///
    /// # Errors
    ///
    /// Returns any [`TopologyError`] raised by graph validation: cycles,
    /// duplicate names, undeclared stores, disconnected nodes, or an empty
    /// graph.
    pub fn build(self) -> Result<Topology, TopologyError> {
        let mut topology = Topology::new();

        for store in self.stores {
            topology.declare_store(store);
        }

        let mut ids = Vec::with_capacity(self.nodes.len());
        for def in &self.nodes {
            ids.push(topology.add_node(def.name.clone(), def.kind.clone())?);
        }

        for (idx, def) in self.nodes.iter().enumerate() {
            for parent in &def.parents {
                let parent_id = ids
                    .get(parent.0 as usize)
                    .copied()
                    .ok_or_else(|| TopologyError::NodeNotFound(format!("{parent}")))?;
                topology.add_edge(parent_id, ids[idx])?;
            }
        }

        topology.finalize()?;
        Ok(topology)
    }

    fn push(&mut self, name: &str, kind: NodeKind, parents: Vec<NodeHandle>) -> NodeHandle {
        let handle = NodeHandle::from_index(self.nodes.len());
        self.nodes.push(NodeDef {
            name: name.to_string(),
            kind,
            parents,
        });
        handle
    }
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl super::NodeId {
    /// Builder-internal: handle for the node at `index`.
    #[allow(clippy::cast_possible_truncation)] // node count bounded well below u32::MAX
    fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

/// Convenience constructor for a key selector that keeps the current key.
#[must_use]
pub fn identity_key_selector() -> KeySelectorFn {
    std::sync::Arc::new(|entry| Ok(Bytes::clone(&entry.key)))
}
