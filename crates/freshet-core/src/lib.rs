//! # Freshet Core
//!
//! The core stream-processing runtime: declarative topology construction,
//! incremental partitioned state, and per-partition task execution.
//!
//! This crate provides:
//! - **Topology**: a declarative DAG from source topics through transforms
//!   and group-bys into stateful aggregation stores
//! - **State Store**: sorted key-value state with point lookups and range
//!   scans, shared between the write path and interactive queries
//! - **Log Source**: an abstraction over a durable, partitioned, ordered
//!   log with consumer-group offset semantics
//! - **Executor**: per-partition processing loops with batched, at-least-once
//!   offset commits
//!
//! ## Processing guarantee
//!
//! The runtime is at-least-once: state mutations are made durable before
//! the corresponding offsets are committed, so a crash between the two
//! re-processes the uncommitted batch. Aggregation functions must be
//! written with replay in mind.
//!
//! ## Example
//!
//! ```rust,ignore
//! use freshet_core::topology::TopologyBuilder;
//!
//! let mut builder = TopologyBuilder::new();
//! builder.add_store("totals");
//! let src = builder.add_source("commits", "commit-log");
//! builder.add_keyed_aggregate(
//!     "sum-by-author",
//!     src,
//!     key_by_author,
//!     init_zero,
//!     add_message_length,
//!     "totals",
//! )?;
//! let topology = builder.build()?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod executor;
pub mod record;
pub mod source;
pub mod state;
pub mod topology;
pub mod window;

pub use config::RuntimeConfig;
pub use record::{Record, StreamEntry};

/// Result type for freshet-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for freshet-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Topology construction errors
    #[error("Topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    /// State store errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Log source errors
    #[error("Source error: {0}")]
    Source(#[from] source::SourceError),

    /// Executor errors
    #[error("Executor error: {0}")]
    Executor(#[from] executor::ExecutorError),
}
