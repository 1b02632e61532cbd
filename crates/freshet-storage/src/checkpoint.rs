//! Checkpoint management for state persistence and recovery.
//!
//! A checkpoint is a directory holding a full state snapshot, the
//! changelog position it covers, and the offsets committed at snapshot
//! time. Recovery loads the newest checkpoint and replays only the
//! changelog tail past its recorded position.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rkyv::{
    rancor::Error as RkyvError, Archive, Deserialize as RkyvDeserialize,
    Serialize as RkyvSerialize,
};
use tracing::{debug, warn};

/// Checkpoint directory name prefix.
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Metadata stored alongside checkpoint data.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct CheckpointMetadata {
    /// Unique checkpoint ID (monotonically increasing).
    pub id: u64,
    /// Changelog position at the time of the snapshot. Replay resumes here.
    pub changelog_position: u64,
    /// Size of the state snapshot in bytes.
    pub state_size: u64,
}

/// A completed checkpoint on disk.
#[derive(Debug)]
pub struct Checkpoint {
    /// Checkpoint metadata.
    pub metadata: CheckpointMetadata,
    /// Path to the checkpoint directory.
    pub path: PathBuf,
}

impl Checkpoint {
    /// Path to the metadata file.
    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        self.path.join("metadata.rkyv")
    }

    /// Path to the state snapshot file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.path.join("state.rkyv")
    }

    /// Path to the committed-offsets sidecar.
    #[must_use]
    pub fn offsets_path(&self) -> PathBuf {
        self.path.join("offsets.json")
    }

    /// Loads the serialized state snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot file cannot be read.
    pub fn load_state(&self) -> Result<Vec<u8>> {
        fs::read(self.state_path()).context("Failed to read state snapshot")
    }

    /// Loads the committed offsets recorded with the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the sidecar exists but cannot be parsed.
    pub fn load_offsets(&self) -> Result<HashMap<String, i64>> {
        let path = self.offsets_path();
        if path.exists() {
            let data = fs::read_to_string(&path).context("Failed to read offsets sidecar")?;
            serde_json::from_str(&data).context("Failed to parse offsets sidecar")
        } else {
            Ok(HashMap::new())
        }
    }
}

/// Manages checkpoint creation, discovery, and retention for one store.
pub struct CheckpointManager {
    /// Directory where checkpoints are stored.
    checkpoint_dir: PathBuf,
    /// How often the owning store should create checkpoints.
    interval: Duration,
    /// Maximum number of checkpoints to retain.
    max_retained: usize,
    /// Next checkpoint ID.
    next_id: u64,
}

impl CheckpointManager {
    /// Creates a manager over `checkpoint_dir`, continuing the ID sequence
    /// of any checkpoints already on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn new(checkpoint_dir: PathBuf, interval: Duration, max_retained: usize) -> Result<Self> {
        fs::create_dir_all(&checkpoint_dir).context("Failed to create checkpoint directory")?;

        let highest = list_checkpoint_ids(&checkpoint_dir)?.into_iter().max();

        Ok(Self {
            checkpoint_dir,
            interval,
            max_retained: max_retained.max(1),
            next_id: highest.map_or(0, |id| id + 1),
        })
    }

    /// The configured checkpoint interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Writes a new checkpoint and prunes old ones.
    ///
    /// The directory is staged under a temporary name and renamed into
    /// place, so a crash mid-write never leaves a readable half-checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if any file write fails.
    pub fn create(
        &mut self,
        state: &[u8],
        changelog_position: u64,
        offsets: &HashMap<String, i64>,
    ) -> Result<Checkpoint> {
        let id = self.next_id;
        self.next_id += 1;

        let final_path = self.checkpoint_dir.join(format!("{CHECKPOINT_PREFIX}{id}"));
        let staging_path = self.checkpoint_dir.join(format!(".staging-{id}"));
        if staging_path.exists() {
            fs::remove_dir_all(&staging_path).context("Failed to clear stale staging dir")?;
        }
        fs::create_dir_all(&staging_path).context("Failed to create staging dir")?;

        let metadata = CheckpointMetadata {
            id,
            changelog_position,
            state_size: state.len() as u64,
        };

        let metadata_bytes = rkyv::to_bytes::<RkyvError>(&metadata)
            .map_err(|e| anyhow::anyhow!("metadata serialization failed: {e}"))?;
        fs::write(staging_path.join("metadata.rkyv"), &metadata_bytes)
            .context("Failed to write checkpoint metadata")?;
        fs::write(staging_path.join("state.rkyv"), state)
            .context("Failed to write state snapshot")?;
        fs::write(
            staging_path.join("offsets.json"),
            serde_json::to_string(offsets).context("Failed to serialize offsets")?,
        )
        .context("Failed to write offsets sidecar")?;

        fs::rename(&staging_path, &final_path).context("Failed to publish checkpoint")?;
        debug!(id, changelog_position, "checkpoint created");

        self.prune()?;

        Ok(Checkpoint {
            metadata,
            path: final_path,
        })
    }

    /// Finds the newest complete checkpoint, if any.
    ///
    /// Unreadable checkpoint directories are skipped with a warning rather
    /// than failing recovery outright.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint directory cannot be listed.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        let mut ids = list_checkpoint_ids(&self.checkpoint_dir)?;
        ids.sort_unstable_by(|a, b| b.cmp(a));

        for id in ids {
            let path = self.checkpoint_dir.join(format!("{CHECKPOINT_PREFIX}{id}"));
            match load_metadata(&path) {
                Ok(metadata) => return Ok(Some(Checkpoint { metadata, path })),
                Err(error) => {
                    warn!(id, %error, "skipping unreadable checkpoint");
                }
            }
        }
        Ok(None)
    }

    /// Removes all but the newest `max_retained` checkpoints.
    fn prune(&self) -> Result<()> {
        let mut ids = list_checkpoint_ids(&self.checkpoint_dir)?;
        if ids.len() <= self.max_retained {
            return Ok(());
        }
        ids.sort_unstable();
        let excess = ids.len() - self.max_retained;
        for id in &ids[..excess] {
            let path = self.checkpoint_dir.join(format!("{CHECKPOINT_PREFIX}{id}"));
            if let Err(error) = fs::remove_dir_all(&path) {
                warn!(id, %error, "failed to prune old checkpoint");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("checkpoint_dir", &self.checkpoint_dir)
            .field("next_id", &self.next_id)
            .field("max_retained", &self.max_retained)
            .finish()
    }
}

fn list_checkpoint_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir).context("Failed to list checkpoint directory")? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id_str) = name.to_string_lossy().strip_prefix(CHECKPOINT_PREFIX) {
            if let Ok(id) = id_str.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

fn load_metadata(path: &Path) -> Result<CheckpointMetadata> {
    let bytes = fs::read(path.join("metadata.rkyv")).context("Failed to read metadata")?;
    rkyv::from_bytes::<CheckpointMetadata, RkyvError>(&bytes)
        .map_err(|e| anyhow::anyhow!("metadata deserialization failed: {e}"))
}
