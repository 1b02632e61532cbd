//! # Freshet Query
//!
//! Interactive queries over live local state stores.
//!
//! [`QueryService`] serves point and range reads against the
//! [`StoreRegistry`] the executor writes to, concurrently with the write
//! path. Keys owned by another instance are answered with a routing hint
//! rather than a miss, via the [`OwnershipDirectory`].
//!
//! The HTTP transport in [`http`] is one framing of the service; the
//! service API itself is transport-free.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod directory;
pub mod http;

use std::sync::Arc;

use bytes::Bytes;

use freshet_core::config::ReplayPolicy;
use freshet_core::state::{StateError, StoreRegistry};

pub use directory::{InstanceAddr, OwnershipDirectory, StaticDirectory};

/// Errors from query operations.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The named store is not registered on this instance.
    #[error("unknown store: {0}")]
    UnknownStore(String),

    /// The store is replaying its changelog. Transient: retry with backoff.
    #[error("store '{0}' is not ready (replay in progress)")]
    StoreNotReady(String),

    /// Underlying state failure.
    #[error("State error: {0}")]
    State(StateError),
}

impl From<StateError> for QueryError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotReady(store) => Self::StoreNotReady(store),
            other => Self::State(other),
        }
    }
}

/// Outcome of a point query.
///
/// `WrongInstance` is a routing signal, not an error: the key exists (if
/// anywhere) on the hinted instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointOutcome {
    /// The key's current value on this instance.
    Value(Bytes),
    /// The key is owned locally but has never been written.
    NotFound,
    /// The key is owned by another instance; query it there.
    WrongInstance(InstanceAddr),
}

/// Serves reads over the stores a topology maintains.
///
/// Cheap to clone; clones share the registry and directory.
#[derive(Clone)]
pub struct QueryService {
    stores: Arc<StoreRegistry>,
    directory: Arc<dyn OwnershipDirectory>,
    local: InstanceAddr,
    replay_policy: ReplayPolicy,
}

impl QueryService {
    /// Creates a query service over `stores`.
    ///
    /// `local` must be the address peers use to reach this instance; it is
    /// compared against directory lookups to decide locality.
    #[must_use]
    pub fn new(
        stores: Arc<StoreRegistry>,
        directory: Arc<dyn OwnershipDirectory>,
        local: InstanceAddr,
        replay_policy: ReplayPolicy,
    ) -> Self {
        Self {
            stores,
            directory,
            local,
            replay_policy,
        }
    }

    /// This instance's address.
    #[must_use]
    pub fn local_addr(&self) -> &InstanceAddr {
        &self.local
    }

    /// Names of the stores this instance serves.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.stores.names()
    }

    /// Looks up `key` in `store`.
    ///
    /// Consults the ownership directory first: a foreign key yields
    /// [`PointOutcome::WrongInstance`] with the owner's address.
    ///
    /// # Errors
    ///
    /// [`QueryError::UnknownStore`] for an unregistered store;
    /// [`QueryError::StoreNotReady`] while the store replays (under
    /// [`ReplayPolicy::Fail`]).
    pub fn point_query(&self, store: &str, key: &[u8]) -> Result<PointOutcome, QueryError> {
        let handle = self
            .stores
            .get(store)
            .ok_or_else(|| QueryError::UnknownStore(store.to_string()))?;

        let owner = self.directory.owner_of(store, key);
        if owner != self.local {
            return Ok(PointOutcome::WrongInstance(owner));
        }

        match handle.get(key, self.replay_policy)? {
            Some(value) => Ok(PointOutcome::Value(value)),
            None => Ok(PointOutcome::NotFound),
        }
    }

    /// Scans `from <= key < to` in `store`, ascending, no duplicates.
    ///
    /// Returns this instance's entries only: a range spans many keys and
    /// therefore, in general, many owners. Callers fan out to peers from
    /// [`store_names`](Self::store_names)-style discovery when they need a
    /// global view.
    ///
    /// # Errors
    ///
    /// Same contract as [`point_query`](Self::point_query).
    pub fn range_query(
        &self,
        store: &str,
        from: &[u8],
        to: &[u8],
    ) -> Result<Vec<(Bytes, Bytes)>, QueryError> {
        let handle = self
            .stores
            .get(store)
            .ok_or_else(|| QueryError::UnknownStore(store.to_string()))?;
        Ok(handle.range(from, to, self.replay_policy)?)
    }
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("local", &self.local)
            .field("stores", &self.stores.names())
            .finish_non_exhaustive()
    }
}
