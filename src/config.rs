use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When a new index entry is added to a segment's index. The first record of a
/// segment is always indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexPolicy {
    /// Add an entry after this many requests since the previous one.
    pub requests_per_entry: u64,
    /// Add an entry once this many bytes were written since the previous one.
    pub bytes_per_entry: u64,
}

impl Default for IndexPolicy {
    fn default() -> Self {
        Self {
            requests_per_entry: 1_000,
            bytes_per_entry: 64 * 1024,
        }
    }
}

/// When the segment state is checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    /// Checkpoint inline after this many requests since the last checkpoint.
    pub requests_per_checkpoint: u64,
    /// Period of the background checkpointer, `None` disables it.
    pub interval_ms: Option<u64>,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            requests_per_checkpoint: 10_000,
            interval_ms: Some(60_000),
        }
    }
}

impl CheckpointPolicy {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory holding segment and checkpoint files.
    pub dir: PathBuf,
    /// Wipe `dir` when opening.
    pub truncate_at_start: bool,
    /// Bytes before rotating to a new segment.
    pub max_segment_size: u64,
    /// fsync after every append. When false an append is only flushed to the OS
    /// and becomes durable on the next sync, rotation or checkpoint.
    pub sync_on_write: bool,
    pub index: IndexPolicy,
    pub checkpoint: CheckpointPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wal"),
            truncate_at_start: false,
            max_segment_size: 64 * 1024 * 1024,
            sync_on_write: true,
            index: IndexPolicy::default(),
            checkpoint: CheckpointPolicy::default(),
        }
    }
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn with_truncate_at_start(mut self, truncate: bool) -> Self {
        self.truncate_at_start = truncate;
        self
    }

    pub fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    pub fn with_index_policy(mut self, policy: IndexPolicy) -> Self {
        self.index = policy;
        self
    }

    pub fn with_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = policy;
        self
    }
}
