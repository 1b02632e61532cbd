//! Partition ownership directory.
//!
//! State is partitioned across instances, so a query for a key may land
//! on an instance that does not own it. The [`OwnershipDirectory`] maps
//! `(store, key)` to the owning instance; the query service consults it
//! before answering and returns a routing hint for foreign keys.
//!
//! Membership itself is externally maintained. [`StaticDirectory`]
//! implements the lookup over a fixed instance list using the same
//! deterministic partitioner that places records, so ownership always
//! agrees with data placement.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use freshet_core::source::partition_for_key;

/// Network address of a runtime instance, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceAddr(String);

impl InstanceAddr {
    /// Creates an address from `host` and `port`.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{host}:{port}"))
    }

    /// The `host:port` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceAddr {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for InstanceAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Read-only lookup of the instance owning a key.
pub trait OwnershipDirectory: Send + Sync {
    /// The instance that owns `key` in `store`.
    fn owner_of(&self, store: &str, key: &[u8]) -> InstanceAddr;
}

/// Ownership over a fixed, ordered instance list.
///
/// The owner of a key is `instances[hash(key) % len]`, matching how the
/// log partitioner places the key's records. All instances must be
/// configured with the same list in the same order.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    instances: Vec<InstanceAddr>,
}

impl StaticDirectory {
    /// Creates a directory over the given instances.
    ///
    /// # Panics
    ///
    /// Panics if `instances` is empty.
    #[must_use]
    pub fn new(instances: Vec<InstanceAddr>) -> Self {
        assert!(!instances.is_empty(), "directory needs at least one instance");
        Self { instances }
    }

    /// Single-instance directory: every key is local.
    #[must_use]
    pub fn single(local: InstanceAddr) -> Self {
        Self::new(vec![local])
    }

    /// The configured instances.
    #[must_use]
    pub fn instances(&self) -> &[InstanceAddr] {
        &self.instances
    }
}

impl OwnershipDirectory for StaticDirectory {
    fn owner_of(&self, _store: &str, key: &[u8]) -> InstanceAddr {
        #[allow(clippy::cast_sign_loss)] // partitioner output is non-negative
        let idx = partition_for_key(key, self.instances.len()) as usize;
        self.instances[idx].clone()
    }
}
