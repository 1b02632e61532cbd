//! Topology graph data structures.
//!
//! Defines [`Node`] and [`Topology`] with topological ordering, cycle
//! detection, and store-declaration validation.

use std::collections::VecDeque;
use std::fmt;

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::error::TopologyError;
use super::{NodeId, NodeKind};

/// A node in the topology.
///
/// Nodes are created during construction and are immutable once the
/// topology is finalized.
pub struct Node {
    /// Unique node identifier.
    pub id: NodeId,
    /// Human-readable name (e.g. "sum-by-author").
    pub name: String,
    /// What the node does.
    pub kind: NodeKind,
    /// Upstream nodes. `SmallVec` avoids heap alloc for <= 4 inputs.
    pub parents: SmallVec<[NodeId; 4]>,
    /// Downstream nodes.
    pub children: SmallVec<[NodeId; 4]>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("parents", &self.parents)
            .field("children", &self.children)
            .finish()
    }
}

/// The complete processing topology.
///
/// Constructed via [`TopologyBuilder`](super::TopologyBuilder) (or directly
/// through [`add_node`](Self::add_node)/[`add_edge`](Self::add_edge) in
/// tests). Once [`finalize`](Self::finalize) succeeds the graph is
/// immutable and ready for execution.
pub struct Topology {
    /// All nodes, keyed by id.
    nodes: FxHashMap<NodeId, Node>,
    /// Declared store names.
    stores: FxHashSet<String>,
    /// Topologically sorted execution order (dependencies first).
    execution_order: Vec<NodeId>,
    /// Source nodes per topic.
    sources_by_topic: FxHashMap<String, Vec<NodeId>>,
    /// Name -> id index for lookups.
    name_index: FxHashMap<String, NodeId>,
    /// Next node id counter.
    next_node_id: u32,
    /// Whether the topology has been finalized.
    finalized: bool,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("node_count", &self.nodes.len())
            .field("stores", &self.stores)
            .field("execution_order", &self.execution_order)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl Topology {
    /// Creates a new empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            stores: FxHashSet::default(),
            execution_order: Vec::new(),
            sources_by_topic: FxHashMap::default(),
            name_index: FxHashMap::default(),
            next_node_id: 0,
            finalized: false,
        }
    }

    /// Declares a state store name.
    ///
    /// Aggregate nodes may only reference declared stores.
    pub fn declare_store(&mut self, name: impl Into<String>) {
        self.stores.insert(name.into());
        self.finalized = false;
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateNode`] if a node with the same
    /// name exists.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
    ) -> Result<NodeId, TopologyError> {
        let name = name.into();
        if self.name_index.contains_key(&name) {
            return Err(TopologyError::DuplicateNode(name));
        }

        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;

        let node = Node {
            id,
            name: name.clone(),
            kind,
            parents: SmallVec::new(),
            children: SmallVec::new(),
        };

        self.nodes.insert(id, node);
        self.name_index.insert(name, id);
        self.finalized = false;

        Ok(id)
    }

    /// Adds an edge between two nodes.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::NodeNotFound`] if either node does not
    /// exist, or [`TopologyError::CycleDetected`] for a self-loop.
    pub fn add_edge(&mut self, parent: NodeId, child: NodeId) -> Result<(), TopologyError> {
        if parent == child {
            let name = self.node_name(parent).unwrap_or_default();
            return Err(TopologyError::CycleDetected(name));
        }
        if !self.nodes.contains_key(&parent) {
            return Err(TopologyError::NodeNotFound(format!("{parent}")));
        }
        if !self.nodes.contains_key(&child) {
            return Err(TopologyError::NodeNotFound(format!("{child}")));
        }

        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(child);
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parents.push(parent);
        }
        self.finalized = false;

        Ok(())
    }

    /// Finalizes the topology: validates the graph and computes execution
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::EmptyTopology`] for a graph with no nodes,
    /// [`TopologyError::CycleDetected`] if edges form a cycle,
    /// [`TopologyError::DisconnectedNode`] if a non-source node has no
    /// upstream, and [`TopologyError::UnknownStore`] if an aggregate
    /// references an undeclared store.
    pub fn finalize(&mut self) -> Result<(), TopologyError> {
        if self.nodes.is_empty() {
            return Err(TopologyError::EmptyTopology);
        }

        self.check_connected()?;
        self.check_stores()?;
        self.compute_execution_order()?;
        self.index_sources();
        self.finalized = true;

        Ok(())
    }

    // ---- Accessors ----

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Returns the id for a node name.
    #[must_use]
    pub fn node_id_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_index.get(name).copied()
    }

    /// Returns the name of a node.
    #[must_use]
    pub fn node_name(&self, id: NodeId) -> Option<String> {
        self.nodes.get(&id).map(|n| n.name.clone())
    }

    /// Returns nodes in topological execution order (dependencies first).
    #[must_use]
    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    /// Returns the source nodes consuming a topic.
    #[must_use]
    pub fn sources_for_topic(&self, topic: &str) -> &[NodeId] {
        self.sources_by_topic.get(topic).map_or(&[], Vec::as_slice)
    }

    /// Returns all topics consumed by source nodes.
    #[must_use]
    pub fn source_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.sources_by_topic.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Returns the declared store names, sorted.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().cloned().collect();
        names.sort();
        names
    }

    /// Returns whether a store name was declared.
    #[must_use]
    pub fn has_store(&self, name: &str) -> bool {
        self.stores.contains(name)
    }

    /// Returns whether the topology has been finalized.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Returns the highest node id plus one, for slot-indexed executors.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.nodes.keys().map(|n| n.0 as usize).max().map_or(0, |m| m + 1)
    }

    // ---- Internal validation ----

    /// Non-source nodes must have at least one upstream; sources must not.
    fn check_connected(&self) -> Result<(), TopologyError> {
        for node in self.nodes.values() {
            match node.kind {
                NodeKind::Source { .. } => {
                    if !node.parents.is_empty() {
                        return Err(TopologyError::DisconnectedNode(node.name.clone()));
                    }
                }
                _ => {
                    if node.parents.is_empty() {
                        return Err(TopologyError::DisconnectedNode(node.name.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Every aggregate must reference a declared store.
    fn check_stores(&self) -> Result<(), TopologyError> {
        for node in self.nodes.values() {
            if let NodeKind::Aggregate { store, .. } = &node.kind {
                if !self.stores.contains(store) {
                    return Err(TopologyError::UnknownStore {
                        store: store.clone(),
                        node: node.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Computes topological execution order via Kahn's algorithm.
    ///
    /// If fewer nodes are ordered than exist, a cycle is present.
    fn compute_execution_order(&mut self) -> Result<(), TopologyError> {
        let (order, processed) = self.kahn_topo_sort();
        if processed < self.nodes.len() {
            let ordered: FxHashSet<NodeId> = order.iter().copied().collect();
            for node in self.nodes.values() {
                if !ordered.contains(&node.id) {
                    return Err(TopologyError::CycleDetected(node.name.clone()));
                }
            }
            return Err(TopologyError::CycleDetected("unknown".to_string()));
        }
        self.execution_order = order;
        Ok(())
    }

    /// Kahn's algorithm. Returns `(ordered_ids, processed_count)`.
    fn kahn_topo_sort(&self) -> (Vec<NodeId>, usize) {
        let mut in_degree: FxHashMap<NodeId, usize> = FxHashMap::default();
        for node in self.nodes.values() {
            in_degree.insert(node.id, node.parents.len());
        }

        let mut initial: Vec<NodeId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        // Sort for deterministic ordering
        initial.sort_by_key(|n| n.0);

        let mut queue: VecDeque<NodeId> = initial.into();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut processed = 0;

        while let Some(node_id) = queue.pop_front() {
            order.push(node_id);
            processed += 1;

            if let Some(node) = self.nodes.get(&node_id) {
                let mut successors: Vec<NodeId> = Vec::new();
                for &child in &node.children {
                    if let Some(deg) = in_degree.get_mut(&child) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            successors.push(child);
                        }
                    }
                }
                successors.sort_by_key(|n| n.0);
                queue.extend(successors);
            }
        }

        (order, processed)
    }

    /// Indexes source nodes by their topic.
    fn index_sources(&mut self) {
        self.sources_by_topic.clear();
        for node in self.nodes.values() {
            if let NodeKind::Source { topic } = &node.kind {
                self.sources_by_topic
                    .entry(topic.clone())
                    .or_default()
                    .push(node.id);
            }
        }
        for sources in self.sources_by_topic.values_mut() {
            sources.sort_by_key(|n| n.0);
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}
