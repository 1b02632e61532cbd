//! Recovery: checkpoint restore plus changelog tail replay.
//!
//! On restart a store rebuilds its index before accepting queries: load
//! the newest checkpoint (if any), replay changelog entries past its
//! recorded position, and truncate a torn tail left by a crash
//! mid-append. Replayed entries are applied directly to the index, not
//! re-logged.

use std::collections::HashMap;

use tracing::{info, warn};

use freshet_core::state::{StateError, StateSnapshot, StateStore};

use crate::changelog::{ChangelogEntry, ReadOutcome};
use crate::durable::DurableStore;

/// What a recovery pass did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Whether a checkpoint snapshot was restored.
    pub snapshot_restored: bool,
    /// Changelog entries replayed past the checkpoint.
    pub entries_replayed: usize,
    /// Position the changelog was truncated at, if a torn tail was found.
    pub truncated_at: Option<u64>,
    /// Offsets from the last commit marker seen (checkpoint or tail).
    pub committed_offsets: HashMap<String, i64>,
}

impl DurableStore {
    /// Rebuilds the in-memory index from the checkpoint and changelog.
    ///
    /// Call once after [`open`](Self::open), before the store is handed to
    /// the executor or query service.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint or changelog cannot be read, or
    /// if a checksum-valid entry fails to decode (real corruption, not a
    /// torn tail).
    pub fn recover(&mut self) -> Result<RecoveryReport, StateError> {
        let mut report = RecoveryReport::default();
        let mut start_position = 0u64;

        self.inner.clear();

        if let Some(manager) = &self.checkpoints {
            let latest = manager
                .latest()
                .map_err(|e| StateError::Io(std::io::Error::other(e)))?;
            if let Some(checkpoint) = latest {
                let state_bytes = checkpoint
                    .load_state()
                    .map_err(|e| StateError::Io(std::io::Error::other(e)))?;
                let snapshot = StateSnapshot::from_bytes(&state_bytes)?;
                self.inner.restore(snapshot);

                report.committed_offsets = checkpoint
                    .load_offsets()
                    .map_err(|e| StateError::Io(std::io::Error::other(e)))?;
                start_position = checkpoint.metadata.changelog_position;
                report.snapshot_restored = true;
                info!(
                    store = %self.name,
                    checkpoint = checkpoint.metadata.id,
                    position = start_position,
                    "restored checkpoint"
                );
            }
        }

        let mut reader = self.changelog.read_from(start_position)?;
        loop {
            match reader.read_next()? {
                ReadOutcome::Entry(entry) => {
                    match entry {
                        ChangelogEntry::Put { key, value } => {
                            self.inner.put(&key, &value)?;
                        }
                        ChangelogEntry::Delete { key } => {
                            self.inner.delete(&key)?;
                        }
                        ChangelogEntry::Commit { offsets } => {
                            report.committed_offsets = offsets;
                        }
                    }
                    report.entries_replayed += 1;
                }
                ReadOutcome::Eof => break,
                ReadOutcome::CorruptTail { position, reason } => {
                    // Expected after a crash mid-append: everything past
                    // the last complete frame is garbage.
                    warn!(
                        store = %self.name,
                        position,
                        reason,
                        "torn changelog tail detected, truncating"
                    );
                    self.changelog.truncate(position)?;
                    report.truncated_at = Some(position);
                    break;
                }
            }
        }

        self.committed_offsets = report.committed_offsets.clone();
        info!(
            store = %self.name,
            entries = report.entries_replayed,
            snapshot = report.snapshot_restored,
            "recovery complete"
        );
        Ok(report)
    }
}

/// Merges per-store committed offsets into a safe resume point.
///
/// Stores flush at the same batch boundary, so their markers normally
/// agree; after a crash between store commits they may differ by one
/// batch. Taking the minimum per partition re-processes that batch
/// everywhere, which at-least-once semantics already permit.
#[must_use]
pub fn merge_committed_offsets(reports: &[RecoveryReport]) -> HashMap<String, i64> {
    let mut merged: HashMap<String, i64> = HashMap::new();
    for report in reports {
        for (partition, &offset) in &report.committed_offsets {
            merged
                .entry(partition.clone())
                .and_modify(|existing| *existing = (*existing).min(offset))
                .or_insert(offset);
        }
    }
    merged
}
