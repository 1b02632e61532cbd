//! # Freshet Storage
//!
//! Durable state for the freshet runtime:
//! - **[`Changelog`]**: append-only, CRC-checked write-ahead log of store
//!   mutations and offset commit markers
//! - **[`DurableStore`]**: a [`StateStore`](freshet_core::state::StateStore)
//!   that logs every mutation before applying it
//! - **[`CheckpointManager`]**: periodic snapshots so recovery replays only
//!   the changelog tail
//! - **Recovery**: snapshot restore plus tail replay, with torn-tail
//!   truncation
//!
//! The commit protocol is at-least-once: a store's mutations are synced to
//! its changelog before the executor commits offsets to the source, so a
//! crash between the two replays the uncommitted batch.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod changelog;
mod checkpoint;
mod durable;
mod recovery;

pub use changelog::{Changelog, ChangelogEntry, ChangelogError, ChangelogReader, ReadOutcome};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
pub use durable::DurableStore;
pub use recovery::{merge_committed_offsets, RecoveryReport};
