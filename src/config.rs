//! STRATA - Engine Configuration
//! Defines tunable parameters for the segment engine.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StrataError};
use crate::types::DiskSegmentMode;

/// Configuration for the Strata storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all data files (WALs, segment devices, topology log).
    pub data_dir: PathBuf,

    /// Number of items the mutable segment accepts before it must be frozen.
    pub mutable_segment_max_item_count: usize,

    /// Layout of the disk segments produced by merges.
    pub disk_segment_mode: DiskSegmentMode,

    /// Lower bound of the randomized record count per disk segment part.
    pub minimum_record_count: usize,

    /// Upper bound of the randomized record count per disk segment part.
    pub maximum_record_count: usize,

    /// A disk segment longer than this moves to the bottom queue after a merge.
    pub disk_segment_max_item_count: usize,

    /// Distance between sparse index samples. `0` disables the sparse index.
    pub sparse_index_step: usize,

    /// Whether to sync WAL writes to disk immediately (fsync).
    pub sync_writes: bool,

    /// Topology log records accumulated before folding them into the snapshot.
    pub topology_log_compaction_threshold: usize,

    /// Upper bound for waiting on read-only segments to become fully frozen.
    pub freeze_wait_timeout: Duration,

    /// Read-only queue length at which the maintainer starts a merge.
    pub read_only_segments_merge_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            mutable_segment_max_item_count: 1_000_000,
            disk_segment_mode: DiskSegmentMode::SingleDiskSegment,
            minimum_record_count: 3_000,
            maximum_record_count: 10_000,
            disk_segment_max_item_count: 20_000_000,
            sparse_index_step: 1_024,
            sync_writes: true,
            topology_log_compaction_threshold: 256,
            freeze_wait_timeout: Duration::from_secs(1),
            read_only_segments_merge_threshold: 4,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the item limit of the mutable segment.
    pub fn with_mutable_segment_max_item_count(mut self, count: usize) -> Self {
        self.mutable_segment_max_item_count = count;
        self
    }

    /// Switch to multi-part disk segments with the given part size bounds.
    pub fn with_multi_part_disk_segments(mut self, minimum: usize, maximum: usize) -> Self {
        self.disk_segment_mode = DiskSegmentMode::MultiPartDiskSegment;
        self.minimum_record_count = minimum;
        self.maximum_record_count = maximum;
        self
    }

    /// Set the disk segment length above which it moves to the bottom queue.
    pub fn with_disk_segment_max_item_count(mut self, count: usize) -> Self {
        self.disk_segment_max_item_count = count;
        self
    }

    /// Set the sparse index sampling step.
    pub fn with_sparse_index_step(mut self, step: usize) -> Self {
        self.sparse_index_step = step;
        self
    }

    /// Enable or disable fsync after every WAL append.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set how many topology records trigger a snapshot.
    pub fn with_topology_log_compaction_threshold(mut self, threshold: usize) -> Self {
        self.topology_log_compaction_threshold = threshold;
        self
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.mutable_segment_max_item_count == 0 {
            return Err(StrataError::Config(
                "mutable_segment_max_item_count must be at least 1".into(),
            ));
        }
        if self.minimum_record_count == 0 {
            return Err(StrataError::Config(
                "minimum_record_count must be at least 1".into(),
            ));
        }
        if self.minimum_record_count > self.maximum_record_count {
            return Err(StrataError::Config(format!(
                "minimum_record_count ({}) exceeds maximum_record_count ({})",
                self.minimum_record_count, self.maximum_record_count
            )));
        }
        if self.topology_log_compaction_threshold == 0 {
            return Err(StrataError::Config(
                "topology_log_compaction_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}
