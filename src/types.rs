//! STRATA - Core Type Definitions
//! Defines fundamental types used across the segment engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide, monotonically increasing segment identifier.
/// `0` is reserved and means "no segment".
pub type SegmentId = u64;

/// Sequence number assigned to every successful write.
pub type OpIndex = u64;

/// Reserved id of the empty disk segment.
pub const EMPTY_SEGMENT_ID: SegmentId = 0;

/// Hands out segment ids. Shared by the engine and the disk segment
/// creators, which allocate ids for new parts.
#[derive(Debug)]
pub struct SegmentIdGenerator {
    next: AtomicU64,
}

impl SegmentIdGenerator {
    /// Generator whose first id is `first` (never below 1).
    pub fn new(first: SegmentId) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> SegmentId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Bound satisfied by keys and values stored in the engine.
pub trait Record: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Record for T {}

/// Outcome of a write against a single mutable segment.
///
/// The two `Retry*` variants are control flow: the caller retries
/// against the (possibly new) current mutable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// The key did not exist in the segment.
    Added,
    /// The key already existed in the segment and was overwritten.
    Updated,
    /// The segment reached its item limit.
    RetrySegmentIsFull,
    /// The segment was frozen before the write could land.
    RetrySegmentIsFrozen,
}

impl OperationResult {
    /// Returns true if the write landed.
    pub fn is_success(self) -> bool {
        matches!(self, OperationResult::Added | OperationResult::Updated)
    }
}

/// Terminal state of one merge invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    NothingToMerge,
    CancelledByUser,
    RetryReadOnlySegmentsNotReady,
    AnotherMergeRunning,
    Failure,
}

/// Physical layout of the disk segments produced by merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskSegmentMode {
    /// Every merge rewrites one contiguous sorted run.
    SingleDiskSegment,
    /// Merges produce runs split into parts that later merges may reuse.
    MultiPartDiskSegment,
}

/// Which tiers an iterator observes and when it re-snapshots them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorMode {
    /// Segment set fixed at creation, mutable segment included.
    NoRefresh,
    /// Re-snapshots the segment set whenever the mutable segment moves forward.
    AutoRefresh,
    /// Forces a freeze, waits for it to settle and reads a point-in-time view.
    Snapshot,
    /// Read-only queue, disk and bottom segments only, no forced freeze.
    ReadOnlyRegion,
}

impl IteratorMode {
    /// Returns true if the mutable segment takes part in the iteration.
    pub fn includes_mutable_segment(self) -> bool {
        matches!(self, IteratorMode::NoRefresh | IteratorMode::AutoRefresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_result_success() {
        assert!(OperationResult::Added.is_success());
        assert!(OperationResult::Updated.is_success());
        assert!(!OperationResult::RetrySegmentIsFull.is_success());
        assert!(!OperationResult::RetrySegmentIsFrozen.is_success());
    }

    #[test]
    fn test_id_generator_skips_reserved_id() {
        let ids = SegmentIdGenerator::new(0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_iterator_mode_tiers() {
        assert!(IteratorMode::AutoRefresh.includes_mutable_segment());
        assert!(IteratorMode::NoRefresh.includes_mutable_segment());
        assert!(!IteratorMode::Snapshot.includes_mutable_segment());
        assert!(!IteratorMode::ReadOnlyRegion.includes_mutable_segment());
    }
}
