//! Runtime configuration.
//!
//! All configuration is carried by an explicit [`RuntimeConfig`] passed at
//! construction. There is no process-wide mutable state.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default commit interval in milliseconds.
pub const DEFAULT_COMMIT_INTERVAL_MS: u64 = 100;

/// Default maximum records per commit batch.
pub const DEFAULT_MAX_BATCH_RECORDS: usize = 512;

/// Default changelog group-commit sync interval in milliseconds.
pub const DEFAULT_CHANGELOG_SYNC_INTERVAL_MS: u64 = 50;

/// Default checkpoint interval in milliseconds.
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 60_000;

/// Default number of retained checkpoints.
pub const DEFAULT_CHECKPOINT_RETAINED: usize = 3;

/// Policy for records whose user transform or aggregate function fails.
///
/// The choice must be explicit: silently diverging behavior between
/// deployments is worse than either option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Log the failure at `warn` and continue with the next record.
    #[default]
    SkipAndLog,

    /// Abort the executor with the failure.
    FailFast,
}

/// Policy for queries issued while a store is replaying its changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayPolicy {
    /// Fail immediately with `StateError::NotReady`; callers retry with backoff.
    #[default]
    Fail,

    /// Block the calling thread until replay completes.
    Block,
}

/// Configuration for a runtime instance.
///
/// Deserializable from the `[runtime]` section of a server config file.
/// Everything except `application_id` has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Application identifier. Scopes state directories and consumer groups.
    pub application_id: String,

    /// Endpoints of the backing log cluster.
    #[serde(default)]
    pub bootstrap_endpoints: Vec<String>,

    /// Root directory for local state (changelogs, checkpoints).
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,

    /// Commit batches at least this often.
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,

    /// Commit after at most this many records, even before the interval elapses.
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,

    /// Window size for windowed aggregations, if any are configured.
    #[serde(default)]
    pub window_size_ms: Option<u64>,

    /// Window advance for hopping windows. Defaults to the window size
    /// (tumbling) when unset.
    #[serde(default)]
    pub window_advance_ms: Option<u64>,

    /// What to do when a user function fails on a record.
    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// What queries do while a store replays its changelog.
    #[serde(default)]
    pub replay_policy: ReplayPolicy,

    /// Changelog group-commit sync interval.
    #[serde(default = "default_changelog_sync_interval_ms")]
    pub changelog_sync_interval_ms: u64,

    /// How often to snapshot store state into a checkpoint.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,

    /// How many checkpoints to retain per store.
    #[serde(default = "default_checkpoint_retained")]
    pub checkpoint_retained: usize,
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("./freshet-state")
}

fn default_commit_interval_ms() -> u64 {
    DEFAULT_COMMIT_INTERVAL_MS
}

fn default_max_batch_records() -> usize {
    DEFAULT_MAX_BATCH_RECORDS
}

fn default_changelog_sync_interval_ms() -> u64 {
    DEFAULT_CHANGELOG_SYNC_INTERVAL_MS
}

fn default_checkpoint_interval_ms() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL_MS
}

fn default_checkpoint_retained() -> usize {
    DEFAULT_CHECKPOINT_RETAINED
}

impl RuntimeConfig {
    /// Creates a configuration with defaults for everything but the id.
    #[must_use]
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            bootstrap_endpoints: Vec::new(),
            state_directory: default_state_directory(),
            commit_interval_ms: DEFAULT_COMMIT_INTERVAL_MS,
            max_batch_records: DEFAULT_MAX_BATCH_RECORDS,
            window_size_ms: None,
            window_advance_ms: None,
            error_policy: ErrorPolicy::default(),
            replay_policy: ReplayPolicy::default(),
            changelog_sync_interval_ms: DEFAULT_CHANGELOG_SYNC_INTERVAL_MS,
            checkpoint_interval_ms: DEFAULT_CHECKPOINT_INTERVAL_MS,
            checkpoint_retained: DEFAULT_CHECKPOINT_RETAINED,
        }
    }

    /// Commit interval as a [`Duration`].
    #[must_use]
    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    /// Changelog sync interval as a [`Duration`].
    #[must_use]
    pub fn changelog_sync_interval(&self) -> Duration {
        Duration::from_millis(self.changelog_sync_interval_ms)
    }

    /// Checkpoint interval as a [`Duration`].
    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    /// State directory scoped to this application.
    #[must_use]
    pub fn application_state_dir(&self) -> PathBuf {
        self.state_directory.join(&self.application_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::new("test-app");
        assert_eq!(config.commit_interval_ms, DEFAULT_COMMIT_INTERVAL_MS);
        assert_eq!(config.max_batch_records, DEFAULT_MAX_BATCH_RECORDS);
        assert_eq!(config.error_policy, ErrorPolicy::SkipAndLog);
        assert_eq!(config.replay_policy, ReplayPolicy::Fail);
        assert!(config.window_size_ms.is_none());
    }

    #[test]
    fn test_application_state_dir() {
        let mut config = RuntimeConfig::new("app1");
        config.state_directory = PathBuf::from("/var/lib/freshet");
        assert_eq!(
            config.application_state_dir(),
            PathBuf::from("/var/lib/freshet/app1")
        );
    }
}
