//! Error types for topology construction and record processing.

/// Errors that can occur while building or validating a topology.
///
/// All variants are fatal at startup and are never retried.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// The graph contains a cycle involving the named node.
    #[error("cycle detected involving node: {0}")]
    CycleDetected(String),

    /// A node references a store name that was never declared.
    #[error("unknown store '{store}' referenced by node '{node}'")]
    UnknownStore {
        /// Store name that was referenced.
        store: String,
        /// Node that referenced it.
        node: String,
    },

    /// A node with the same name already exists.
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    /// An edge references a node that does not exist.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A non-source node has no upstream connection.
    #[error("disconnected node: {0}")]
    DisconnectedNode(String),

    /// The topology has no nodes.
    #[error("empty topology: no nodes")]
    EmptyTopology,
}

/// A failure raised by a user-supplied transform, key-selector, or
/// aggregation function.
///
/// How the executor reacts is governed by
/// [`ErrorPolicy`](crate::config::ErrorPolicy).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProcessingError(String);

impl ProcessingError {
    /// Creates a processing error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for ProcessingError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ProcessingError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}
