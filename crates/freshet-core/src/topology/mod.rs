//! Declarative processing topology.
//!
//! A [`Topology`] is a DAG from source topics through transforms and
//! group-bys into stateful aggregation stores and sink topics. It is built
//! via [`TopologyBuilder`] before execution starts; no record flows until an
//! executor is handed the finished graph.

mod builder;
mod error;
mod graph;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::record::StreamEntry;
use crate::window::WindowSpec;

pub use builder::{identity_key_selector, TopologyBuilder};
pub use error::{ProcessingError, TopologyError};
pub use graph::{Node, Topology};

/// Unique identifier for a node in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Opaque handle returned by builder methods, used to wire edges.
pub type NodeHandle = NodeId;

/// A stateless transform. May emit zero, one, or many entries per input
/// (flat-map semantics).
pub type TransformFn =
    Arc<dyn Fn(&StreamEntry) -> Result<Vec<StreamEntry>, ProcessingError> + Send + Sync>;

/// Selects the grouping key for a group-by node.
pub type KeySelectorFn = Arc<dyn Fn(&StreamEntry) -> Result<Bytes, ProcessingError> + Send + Sync>;

/// Produces the initial aggregate value for a key seen for the first time.
pub type InitFn = Arc<dyn Fn() -> Bytes + Send + Sync>;

/// Folds a record into the current aggregate: `(key, value, current) -> new`.
pub type AggregateFn =
    Arc<dyn Fn(&[u8], &[u8], &[u8]) -> Result<Bytes, ProcessingError> + Send + Sync>;

/// What a topology node does with the entries that reach it.
#[derive(Clone)]
pub enum NodeKind {
    /// Entry point reading from a named topic.
    Source {
        /// Topic this source consumes.
        topic: String,
    },
    /// Stateless flat-map transform.
    Transform {
        /// The user function.
        func: TransformFn,
    },
    /// Re-keys entries for downstream aggregation.
    GroupBy {
        /// The key selector.
        selector: KeySelectorFn,
    },
    /// Stateful fold into a named store. Emits the updated pair downstream.
    Aggregate {
        /// Initial value for unseen keys.
        init: InitFn,
        /// The fold function.
        agg: AggregateFn,
        /// Declared store the aggregate writes to.
        store: String,
        /// Optional windowing. `None` means one running value per key.
        windows: Option<WindowSpec>,
    },
    /// Terminal node writing entries to an output topic.
    Sink {
        /// Topic this sink produces to.
        topic: String,
    },
}

impl NodeKind {
    /// Short label for diagnostics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Source { .. } => "source",
            Self::Transform { .. } => "transform",
            Self::GroupBy { .. } => "group-by",
            Self::Aggregate { .. } => "aggregate",
            Self::Sink { .. } => "sink",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source { topic } => f.debug_struct("Source").field("topic", topic).finish(),
            Self::Transform { .. } => f.write_str("Transform(..)"),
            Self::GroupBy { .. } => f.write_str("GroupBy(..)"),
            Self::Aggregate { store, windows, .. } => f
                .debug_struct("Aggregate")
                .field("store", store)
                .field("windows", windows)
                .finish_non_exhaustive(),
            Self::Sink { topic } => f.debug_struct("Sink").field("topic", topic).finish(),
        }
    }
}
