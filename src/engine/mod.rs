//! STRATA - Segment Engine
//! Top-level module tying the LSM tiers together.
//!
//! ## Tiers
//! ```text
//! writes ──► segment zero ──freeze──► read-only queue ──merge──► disk segment
//!                                                                    │
//!                                          bottom segments ◄──promote┘
//! ```
//! Reads walk the same tiers newest to oldest and stop at the first hit.
//!
//! ## Locks
//! - *update lock*: segment zero swap and the check-then-write of the
//!   atomic compound operations;
//! - *topology lock*: short, guards the visible set of segments;
//! - *merge flag*: single-flight guard held for a whole merge pass.

pub mod disk;
pub mod heap;
pub mod iterator;
pub mod maintainer;
pub mod map;
pub mod merge;
pub mod metrics;
pub mod seekable;
pub mod segment;
pub mod topology;
pub mod wal;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use self::disk::creator::SegmentCreator;
use self::disk::iterator::DiskSegmentIterator;
use self::disk::{DiskSegment, DiskSegmentReader, DropFailureReporter};
use self::iterator::StrataIterator;
use self::merge::{for_each_latest, run_merge, MergeOutcome, SourceIterator};
use self::metrics::{Counter, EngineMetrics};
use self::segment::{MutableSegment, ReadOnlySegment};
use self::topology::{TopologyLog, TopologyOperation, TopologyRecord};
use crate::device::DeviceCategory;
use crate::error::{Result, StrataError};
use crate::options::EngineOptions;
use crate::types::{
    IteratorMode, MergeResult, OpIndex, OperationResult, Record, SegmentId, SegmentIdGenerator,
    EMPTY_SEGMENT_ID,
};

pub type SegmentEventHandler = Arc<dyn Fn(SegmentId) + Send + Sync>;
pub type MergeEventHandler = Arc<dyn Fn(MergeResult) + Send + Sync>;

#[derive(Default)]
struct EventHandlers {
    segment_zero_moved_forward: Vec<SegmentEventHandler>,
    merge_operation_ended: Vec<MergeEventHandler>,
    disk_segment_created: Vec<SegmentEventHandler>,
    can_not_drop_read_only_segment: Vec<DropFailureReporter>,
    can_not_drop_disk_segment: Vec<DropFailureReporter>,
}

struct Topology<K, V> {
    segment_zero: Arc<MutableSegment<K, V>>,
    /// Oldest at the front.
    read_only: VecDeque<Arc<ReadOnlySegment<K, V>>>,
    disk: Arc<DiskSegment<K, V>>,
    /// Oldest at index 0.
    bottom: Vec<Arc<DiskSegment<K, V>>>,
}

/// A consistent view of every tier, newest first, with disk segments
/// pinned for as long as the view lives.
pub(crate) struct TopologySnapshot<K: Record, V: Record> {
    pub segment_zero: Option<Arc<MutableSegment<K, V>>>,
    /// Newest first.
    pub read_only: Vec<Arc<ReadOnlySegment<K, V>>>,
    pub disk: DiskSegmentReader<K, V>,
    /// Newest first.
    pub bottom: Vec<DiskSegmentReader<K, V>>,
    pub generation: u64,
}

impl<K: Record, V: Record + Default> TopologySnapshot<K, V> {
    fn memory_segments(&self) -> impl Iterator<Item = &Arc<MutableSegment<K, V>>> {
        self.segment_zero.iter().chain(self.read_only.iter())
    }

    /// Newest in-memory value of `key`, tombstones included.
    fn try_get_memory(&self, key: &K) -> Option<V> {
        self.memory_segments().find_map(|segment| segment.try_get(key))
    }

    /// Newest on-disk value of `key`, tombstones included.
    fn try_get_disk(&self, key: &K) -> Result<Option<V>> {
        if let Some(value) = self.disk.try_get(key)? {
            return Ok(Some(value));
        }
        for segment in &self.bottom {
            if let Some(value) = segment.try_get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Disk segment followed by the bottom segments.
    fn disk_ids(&self) -> Vec<SegmentId> {
        std::iter::once(self.disk.id())
            .chain(self.bottom.iter().map(|s| s.id()))
            .collect()
    }

    fn memory_sources(&self) -> Vec<SourceIterator<K, V>> {
        self.memory_segments()
            .map(|s| SourceIterator::Memory(s.iter()))
            .collect()
    }

    /// One source per segment, newest first.
    pub(crate) fn sources(&self) -> Vec<SourceIterator<K, V>> {
        let mut sources = self.memory_sources();
        sources.push(SourceIterator::Disk(DiskSegmentIterator::pinned(
            self.disk.clone(),
        )));
        for segment in &self.bottom {
            sources.push(SourceIterator::Disk(DiskSegmentIterator::pinned(
                segment.clone(),
            )));
        }
        sources
    }
}

/// Handle of a merge started in the background.
pub struct MergeHandle {
    state: MergeHandleState,
}

enum MergeHandleState {
    Finished(MergeResult),
    Running(JoinHandle<MergeResult>),
}

impl MergeHandle {
    fn finished(result: MergeResult) -> Self {
        Self {
            state: MergeHandleState::Finished(result),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            MergeHandleState::Finished(_) => true,
            MergeHandleState::Running(handle) => handle.is_finished(),
        }
    }

    /// Block until the merge ends.
    pub fn join(self) -> MergeResult {
        match self.state {
            MergeHandleState::Finished(result) => result,
            MergeHandleState::Running(handle) => handle.join().unwrap_or(MergeResult::Failure),
        }
    }
}

/// Releases the merge flag when a merge thread ends.
struct MergeGuard<K: Record, V: Record + Default> {
    shared: Arc<Shared<K, V>>,
}

impl<K: Record, V: Record + Default> Drop for MergeGuard<K, V> {
    fn drop(&mut self) {
        self.shared.merging.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
enum MergeJob {
    Top,
    Bottom { from: usize, to: usize },
}

pub(crate) struct Shared<K: Record, V: Record + Default> {
    pub(crate) options: Arc<EngineOptions<K, V>>,
    ids: Arc<SegmentIdGenerator>,
    op_index: AtomicU64,
    topology: RwLock<Topology<K, V>>,
    topology_log: Mutex<TopologyLog>,
    update_lock: Mutex<()>,
    merging: AtomicBool,
    cancel_merge: AtomicBool,
    generation: AtomicU64,
    read_only: AtomicBool,
    metrics: EngineMetrics,
    events: RwLock<EventHandlers>,
}

impl<K: Record, V: Record + Default> Shared<K, V> {
    fn open(options: EngineOptions<K, V>) -> Result<Self> {
        options.config.validate()?;
        options.config.ensure_dirs()?;
        let options = Arc::new(options);
        let config = &options.config;
        let manager = options.device_manager.clone();

        let mut log = TopologyLog::open(
            &config.data_dir,
            config.topology_log_compaction_threshold,
            config.sync_writes,
        )?;
        let state = log.state().clone();
        let metrics = EngineMetrics::new();

        let stored_max = manager.segment_ids()?.into_iter().max().unwrap_or(0);
        let ids = Arc::new(SegmentIdGenerator::new(
            state.max_segment_id.max(stored_max) + 1,
        ));
        let mut op_index = state.op_index;

        let mut read_only = VecDeque::with_capacity(state.read_only.len());
        for &id in &state.read_only {
            let (segment, max_op) = MutableSegment::recover(id, options.clone())?;
            segment.freeze();
            segment.wait_fully_frozen(Duration::ZERO)?;
            op_index = op_index.max(max_op);
            metrics.increment(Counter::RecoveredSegments);
            read_only.push_back(Arc::new(segment));
        }

        let disk = Arc::new(DiskSegment::open(state.disk_segment, options.clone())?);
        let bottom = state
            .bottom
            .iter()
            .map(|&id| DiskSegment::open(id, options.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let segment_zero = if state.mutable_segment != EMPTY_SEGMENT_ID {
            let (segment, max_op) = MutableSegment::recover(state.mutable_segment, options.clone())?;
            op_index = op_index.max(max_op);
            metrics.increment(Counter::RecoveredSegments);
            segment
        } else {
            let id = ids.next_id();
            let segment = MutableSegment::create(id, options.clone())?;
            log.append(&[TopologyRecord::with_index(
                TopologyOperation::NewMutableSegment,
                id,
                op_index,
            )])?;
            segment
        };

        let mut referenced: HashSet<SegmentId> = state.referenced_ids().into_iter().collect();
        referenced.insert(segment_zero.id());
        referenced.extend(disk.part_ids());
        for segment in &bottom {
            referenced.extend(segment.part_ids());
        }
        let mut swept = 0;
        for id in manager.segment_ids()? {
            if !referenced.contains(&id) {
                for category in DeviceCategory::ALL {
                    manager.delete(id, category)?;
                }
                swept += 1;
            }
        }
        if swept > 0 {
            log::warn!("Removed {} orphaned segment(s) from {:?}", swept, config.data_dir);
        }

        log::info!(
            "Strata engine opened at {:?}: segment zero {} ({} entries), {} read-only, disk segment {} ({} records), {} bottom",
            config.data_dir,
            segment_zero.id(),
            segment_zero.len(),
            read_only.len(),
            disk.id(),
            disk.len(),
            bottom.len()
        );

        Ok(Self {
            ids,
            op_index: AtomicU64::new(op_index),
            topology: RwLock::new(Topology {
                segment_zero: Arc::new(segment_zero),
                read_only,
                disk,
                bottom,
            }),
            topology_log: Mutex::new(log),
            update_lock: Mutex::new(()),
            merging: AtomicBool::new(false),
            cancel_merge: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            read_only: AtomicBool::new(false),
            metrics,
            events: RwLock::new(EventHandlers::default()),
            options,
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self, include_mutable: bool) -> TopologySnapshot<K, V> {
        let topology = self.topology.read();
        TopologySnapshot {
            segment_zero: include_mutable.then(|| topology.segment_zero.clone()),
            read_only: topology.read_only.iter().rev().cloned().collect(),
            disk: DiskSegmentReader::new(topology.disk.clone()),
            bottom: topology
                .bottom
                .iter()
                .rev()
                .map(|s| DiskSegmentReader::new(s.clone()))
                .collect(),
            generation: self.generation(),
        }
    }

    fn segment_zero(&self) -> Arc<MutableSegment<K, V>> {
        self.topology.read().segment_zero.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StrataError::ReadOnly);
        }
        Ok(())
    }

    /// Retry `op` against segment zero until it lands. A full segment is
    /// moved forward; a frozen one is about to be replaced.
    fn write_with<F>(&self, locked: bool, moved: &mut Vec<SegmentId>, mut op: F) -> Result<OpIndex>
    where
        F: FnMut(&MutableSegment<K, V>) -> Result<(OperationResult, Option<OpIndex>)>,
    {
        loop {
            let segment = self.segment_zero();
            let (result, op_index) = op(segment.as_ref())?;
            match result {
                OperationResult::Added | OperationResult::Updated => {
                    return op_index.ok_or_else(|| {
                        StrataError::Corruption(format!(
                            "write to segment {} landed without an op index",
                            segment.id()
                        ))
                    });
                }
                OperationResult::RetrySegmentIsFull => {
                    if locked {
                        if let Some(id) = self.move_forward_locked(Some(segment.id()))? {
                            moved.push(id);
                        }
                    } else {
                        self.move_segment_zero_forward_if(Some(segment.id()))?;
                    }
                }
                OperationResult::RetrySegmentIsFrozen => std::thread::yield_now(),
            }
        }
    }

    fn upsert(&self, key: K, value: V, locked: bool, moved: &mut Vec<SegmentId>) -> Result<OpIndex> {
        let op_index = self.write_with(locked, moved, |segment| {
            segment.upsert(key.clone(), value.clone(), &self.op_index)
        })?;
        self.metrics.increment(Counter::Upserts);
        Ok(op_index)
    }

    fn delete(&self, key: K, locked: bool, moved: &mut Vec<SegmentId>) -> Result<OpIndex> {
        let op_index = self.write_with(locked, moved, |segment| {
            segment.delete(key.clone(), &self.op_index)
        })?;
        self.metrics.increment(Counter::Deletes);
        Ok(op_index)
    }

    /// Newest stored value, tombstones included.
    fn try_get_raw(&self, key: &K) -> Result<Option<V>> {
        let snapshot = self.snapshot(true);
        match snapshot.try_get_memory(key) {
            Some(value) => Ok(Some(value)),
            None => snapshot.try_get_disk(key),
        }
    }

    fn try_get(&self, key: &K) -> Result<Option<V>> {
        self.metrics.increment(Counter::Gets);
        Ok(self
            .try_get_raw(key)?
            .filter(|value| !self.options.deletion.is_deleted(value)))
    }

    pub(crate) fn move_segment_zero_forward(&self) -> Result<bool> {
        self.move_segment_zero_forward_if(None)
    }

    fn move_segment_zero_forward_if(&self, expected: Option<SegmentId>) -> Result<bool> {
        let moved = {
            let _update = self.update_lock.lock();
            self.move_forward_locked(expected)?
        };
        if let Some(id) = moved {
            self.emit_segment_zero_moved_forward(id);
        }
        Ok(moved.is_some())
    }

    /// Freeze segment zero into the read-only queue and install a fresh one.
    /// Caller holds the update lock. Returns the id of the frozen segment,
    /// or `None` if `expected` is no longer current or segment zero is empty.
    fn move_forward_locked(&self, expected: Option<SegmentId>) -> Result<Option<SegmentId>> {
        let current = self.segment_zero();
        if expected.map_or(false, |id| id != current.id()) || current.is_empty() {
            return Ok(None);
        }

        let next_id = self.ids.next_id();
        let next = Arc::new(MutableSegment::create(next_id, self.options.clone())?);
        {
            let mut topology = self.topology.write();
            let logged = self.topology_log.lock().append(&[
                TopologyRecord::new(TopologyOperation::EnqueueReadOnlySegment, current.id()),
                TopologyRecord::with_index(
                    TopologyOperation::NewMutableSegment,
                    next_id,
                    self.op_index.load(Ordering::SeqCst),
                ),
            ]);
            if let Err(err) = logged {
                drop(topology);
                if let Err(drop_err) = next.drop_storage() {
                    log::warn!("Failed to remove unused segment {}: {}", next_id, drop_err);
                }
                return Err(err);
            }
            current.freeze();
            topology.read_only.push_back(current.clone());
            topology.segment_zero = next;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.metrics.increment(Counter::Freezes);
        log::debug!(
            "Segment zero {} moved forward ({} entries), new segment zero {}",
            current.id(),
            current.len(),
            next_id
        );
        Ok(Some(current.id()))
    }

    fn count(&self) -> Result<usize> {
        let snapshot = self.snapshot(true);
        if snapshot.disk.has_tombstones() || !snapshot.bottom.is_empty() {
            return self.count_snapshot(snapshot);
        }
        let deletion = self.options.deletion.clone();
        let disk = snapshot.disk.clone();
        let mut count = disk.len() as i64;
        for_each_latest(
            snapshot.memory_sources(),
            self.options.comparer.clone(),
            |key, value| {
                match (deletion.is_deleted(&value), disk.contains_key(&key)?) {
                    (false, false) => count += 1,
                    (true, true) => count -= 1,
                    _ => {}
                }
                Ok(())
            },
        )?;
        Ok(count.max(0) as usize)
    }

    fn count_snapshot(&self, snapshot: TopologySnapshot<K, V>) -> Result<usize> {
        let deletion = self.options.deletion.clone();
        let mut count = 0;
        for_each_latest(
            snapshot.sources(),
            self.options.comparer.clone(),
            |_, value| {
                if !deletion.is_deleted(&value) {
                    count += 1;
                }
                Ok(())
            },
        )?;
        Ok(count)
    }

    fn start_merge(self: &Arc<Self>, job: MergeJob) -> MergeHandle {
        if self
            .merging
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.finish_merge(MergeResult::AnotherMergeRunning);
            return MergeHandle::finished(MergeResult::AnotherMergeRunning);
        }
        self.cancel_merge.store(false, Ordering::SeqCst);
        let guard = MergeGuard {
            shared: self.clone(),
        };
        let shared = self.clone();
        let spawned = std::thread::Builder::new()
            .name("strata-merge".into())
            .spawn(move || {
                let result = {
                    let _guard = guard;
                    shared.run_merge_job(job)
                };
                shared.finish_merge(result);
                result
            });
        match spawned {
            Ok(handle) => MergeHandle {
                state: MergeHandleState::Running(handle),
            },
            Err(err) => {
                log::error!("Failed to start merge thread: {}", err);
                self.finish_merge(MergeResult::Failure);
                MergeHandle::finished(MergeResult::Failure)
            }
        }
    }

    fn run_merge_job(self: &Arc<Self>, job: MergeJob) -> MergeResult {
        let outcome = match job {
            MergeJob::Top => self.merge_top(),
            MergeJob::Bottom { from, to } => self.merge_bottom(from, to),
        };
        match outcome {
            Ok(result) => result,
            Err(err) => {
                log::error!("Merge failed: {}", err);
                MergeResult::Failure
            }
        }
    }

    fn finish_merge(&self, result: MergeResult) {
        self.metrics.record_merge(result);
        let handlers = self.events.read().merge_operation_ended.clone();
        for handler in handlers {
            handler(result);
        }
    }

    fn disk_drop_reporter(self: &Arc<Self>) -> DropFailureReporter {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |id: SegmentId, err: &StrataError| {
            if let Some(shared) = weak.upgrade() {
                let handlers = shared.events.read().can_not_drop_disk_segment.clone();
                for handler in handlers {
                    handler(id, err);
                }
            }
        })
    }

    /// Merge the read-only queue and the disk segment into a new disk segment.
    fn merge_top(self: &Arc<Self>) -> Result<MergeResult> {
        let (read_only, disk, bottom_empty) = {
            let topology = self.topology.read();
            (
                topology.read_only.iter().cloned().collect::<Vec<_>>(),
                DiskSegmentReader::new(topology.disk.clone()),
                topology.bottom.is_empty(),
            )
        };
        if read_only.is_empty() {
            return Ok(MergeResult::NothingToMerge);
        }
        let timeout = self.options.config.freeze_wait_timeout;
        for segment in &read_only {
            if !segment.wait_fully_frozen(timeout)? {
                log::debug!("Read-only segment {} is not fully frozen yet", segment.id());
                return Ok(MergeResult::RetryReadOnlySegmentsNotReady);
            }
        }

        log::info!(
            "Merge started: {} read-only segment(s) into disk segment {} ({} records)",
            read_only.len(),
            disk.id(),
            disk.len()
        );

        let mut sources: Vec<SourceIterator<K, V>> = read_only
            .iter()
            .rev()
            .map(|s| SourceIterator::Memory(s.iter()))
            .collect();
        sources.push(SourceIterator::Disk(DiskSegmentIterator::pinned(disk.clone())));

        let creator = SegmentCreator::new(
            self.options.config.disk_segment_mode,
            self.ids.next_id(),
            self.options.clone(),
            self.ids.clone(),
        )?;
        let (segment, stats) =
            match run_merge(sources, creator, &self.options, bottom_empty, &self.cancel_merge)? {
                MergeOutcome::Cancelled => {
                    log::info!("Merge cancelled");
                    return Ok(MergeResult::CancelledByUser);
                }
                MergeOutcome::Completed(segment, stats) => (Arc::new(segment), stats),
            };

        let consumed: Vec<SegmentId> = read_only.iter().map(|s| s.id()).collect();
        let committed = {
            let mut topology = self.topology.write();
            let head_matches = topology
                .read_only
                .iter()
                .take(consumed.len())
                .map(|s| s.id())
                .eq(consumed.iter().copied());
            if !head_matches {
                Err(StrataError::TopologyCorruption(
                    "read-only queue changed under a running merge".into(),
                ))
            } else {
                let mut records = vec![TopologyRecord::with_index(
                    TopologyOperation::NewDiskSegment,
                    segment.id(),
                    self.op_index.load(Ordering::SeqCst),
                )];
                records.extend(
                    consumed
                        .iter()
                        .map(|&id| TopologyRecord::new(TopologyOperation::DequeueReadOnlySegment, id)),
                );
                self.topology_log.lock().append(&records).map(|()| {
                    topology.read_only.drain(..consumed.len());
                    std::mem::replace(&mut topology.disk, segment.clone())
                })
            }
        };
        let old = match committed {
            Ok(old) => old,
            Err(err) => {
                segment.request_drop(disk.part_ids().into_iter().collect(), None);
                return Err(err);
            }
        };

        let exclusions: HashSet<SegmentId> = segment.part_ids().into_iter().collect();
        old.request_drop(exclusions, Some(self.disk_drop_reporter()));
        drop(disk);
        for ro in &read_only {
            if let Err(err) = ro.drop_storage() {
                log::warn!("Failed to drop read-only segment {}: {}", ro.id(), err);
                let handlers = self.events.read().can_not_drop_read_only_segment.clone();
                for handler in handlers {
                    handler(ro.id(), &err);
                }
            }
        }

        self.metrics
            .record_merge_output(stats.written, stats.dropped, stats.skipped_parts);
        log::info!(
            "Merge completed: disk segment {} with {} records ({} written, {} dropped, {} parts reused)",
            segment.id(),
            segment.len(),
            stats.written,
            stats.dropped,
            stats.skipped_parts
        );
        if !segment.is_empty() {
            self.emit_disk_segment_created(segment.id());
        }
        if let Err(err) = self.promote_to_bottom(&segment) {
            log::warn!(
                "Failed to move disk segment {} to the bottom queue: {}",
                segment.id(),
                err
            );
        }
        Ok(MergeResult::Success)
    }

    /// Move an oversized disk segment to the bottom queue.
    fn promote_to_bottom(&self, segment: &Arc<DiskSegment<K, V>>) -> Result<()> {
        if segment.len() <= self.options.config.disk_segment_max_item_count {
            return Ok(());
        }
        let mut topology = self.topology.write();
        if topology.disk.id() != segment.id() {
            return Ok(());
        }
        self.topology_log.lock().append(&[
            TopologyRecord::new(TopologyOperation::EnqueueBottomSegment, segment.id()),
            TopologyRecord::with_index(
                TopologyOperation::NewDiskSegment,
                EMPTY_SEGMENT_ID,
                self.op_index.load(Ordering::SeqCst),
            ),
        ])?;
        topology.bottom.push(segment.clone());
        topology.disk = Arc::new(DiskSegment::empty());
        log::info!(
            "Disk segment {} ({} records) moved to the bottom queue",
            segment.id(),
            segment.len()
        );
        Ok(())
    }

    /// Merge bottom segments `from..=to` (0 is the oldest) into one.
    fn merge_bottom(self: &Arc<Self>, from: usize, to: usize) -> Result<MergeResult> {
        let readers: Vec<DiskSegmentReader<K, V>> = {
            let topology = self.topology.read();
            if from > to || to >= topology.bottom.len() {
                return Ok(MergeResult::NothingToMerge);
            }
            topology.bottom[from..=to]
                .iter()
                .map(|s| DiskSegmentReader::new(s.clone()))
                .collect()
        };
        let merged_ids: Vec<SegmentId> = readers.iter().map(|r| r.id()).collect();
        log::info!("Bottom merge started: segments {:?}", merged_ids);

        let sources: Vec<SourceIterator<K, V>> = readers
            .iter()
            .rev()
            .map(|r| SourceIterator::Disk(DiskSegmentIterator::pinned(r.clone())))
            .collect();
        // Tombstones must survive unless nothing older remains below.
        let drop_tombstones = from == 0;

        let creator = SegmentCreator::new(
            self.options.config.disk_segment_mode,
            self.ids.next_id(),
            self.options.clone(),
            self.ids.clone(),
        )?;
        let (segment, stats) =
            match run_merge(sources, creator, &self.options, drop_tombstones, &self.cancel_merge)? {
                MergeOutcome::Cancelled => {
                    log::info!("Bottom merge cancelled");
                    return Ok(MergeResult::CancelledByUser);
                }
                MergeOutcome::Completed(segment, stats) => (Arc::new(segment), stats),
            };

        let committed = {
            let mut topology = self.topology.write();
            let unchanged = topology
                .bottom
                .get(from..=to)
                .map_or(false, |current| current.iter().map(|s| s.id()).eq(merged_ids.iter().copied()));
            if !unchanged {
                Err(StrataError::TopologyCorruption(
                    "bottom queue changed under a running merge".into(),
                ))
            } else {
                let mut records: Vec<TopologyRecord> = merged_ids
                    .iter()
                    .map(|&id| {
                        TopologyRecord::with_index(
                            TopologyOperation::DeleteBottomSegment,
                            id,
                            from as u64,
                        )
                    })
                    .collect();
                if !segment.is_empty() {
                    records.push(TopologyRecord::with_index(
                        TopologyOperation::InsertBottomSegment,
                        segment.id(),
                        from as u64,
                    ));
                }
                self.topology_log.lock().append(&records).map(|()| {
                    let replacement: Vec<Arc<DiskSegment<K, V>>> = if segment.is_empty() {
                        Vec::new()
                    } else {
                        vec![segment.clone()]
                    };
                    topology
                        .bottom
                        .splice(from..=to, replacement)
                        .collect::<Vec<_>>()
                })
            }
        };
        let old = match committed {
            Ok(old) => old,
            Err(err) => {
                let inputs = readers.iter().flat_map(|r| r.part_ids()).collect();
                segment.request_drop(inputs, None);
                return Err(err);
            }
        };

        let exclusions: HashSet<SegmentId> = segment.part_ids().into_iter().collect();
        let reporter = self.disk_drop_reporter();
        for segment in old {
            segment.request_drop(exclusions.clone(), Some(reporter.clone()));
        }
        drop(readers);

        self.metrics
            .record_merge_output(stats.written, stats.dropped, stats.skipped_parts);
        log::info!(
            "Bottom merge completed: segment {} with {} records replaces {:?}",
            segment.id(),
            segment.len(),
            merged_ids
        );
        if !segment.is_empty() {
            self.emit_disk_segment_created(segment.id());
        }
        Ok(MergeResult::Success)
    }

    fn emit_segment_zero_moved_forward(&self, id: SegmentId) {
        let handlers = self.events.read().segment_zero_moved_forward.clone();
        for handler in handlers {
            handler(id);
        }
    }

    fn emit_disk_segment_created(&self, id: SegmentId) {
        let handlers = self.events.read().disk_segment_created.clone();
        for handler in handlers {
            handler(id);
        }
    }
}

/// An embeddable LSM key-value engine.
///
/// Cloning is cheap: every clone shares the same engine.
///
/// ## Example
/// ```no_run
/// use std::sync::Arc;
/// use strata::config::Config;
/// use strata::engine::Strata;
/// use strata::options::{EngineOptions, OptionDeletionPolicy};
///
/// let options: EngineOptions<String, Option<String>> =
///     EngineOptions::new(Config::new("./data"), Arc::new(OptionDeletionPolicy)).unwrap();
/// let engine = Strata::open(options).unwrap();
///
/// engine.upsert("key".into(), Some("value".into())).unwrap();
/// assert_eq!(engine.try_get(&"key".into()).unwrap(), Some(Some("value".into())));
/// ```
pub struct Strata<K: Record, V: Record + Default> {
    shared: Arc<Shared<K, V>>,
}

impl<K: Record, V: Record + Default> Clone for Strata<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K: Record, V: Record + Default> Strata<K, V> {
    /// Open or create an engine, recovering the topology, the WALs of the
    /// in-memory segments and the disk segments.
    pub fn open(options: EngineOptions<K, V>) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared::open(options)?),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared<K, V>> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Arc<Shared<K, V>>) -> Self {
        Self { shared }
    }

    pub fn options(&self) -> &EngineOptions<K, V> {
        &self.shared.options
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }

    /// Insert or replace `key`. Returns the op index of the write.
    pub fn upsert(&self, key: K, value: V) -> Result<OpIndex> {
        self.shared.check_writable()?;
        let mut moved = Vec::new();
        self.shared.upsert(key, value, false, &mut moved)
    }

    /// Write a tombstone for `key`, whether or not it exists.
    pub fn delete(&self, key: K) -> Result<OpIndex> {
        self.shared.check_writable()?;
        let mut moved = Vec::new();
        self.shared.delete(key, false, &mut moved)
    }

    /// Most recent live value of `key`.
    pub fn try_get(&self, key: &K) -> Result<Option<V>> {
        self.shared.try_get(key)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.shared.try_get(key)?.is_some())
    }

    /// Run `body` with the live value of `key` under the update lock and
    /// report segment moves after releasing it.
    ///
    /// Disk tiers are read before the lock is taken. If a merge or a
    /// promotion replaced them in the meantime the read is repeated; the
    /// in-memory segments are consulted under the lock.
    fn atomically<T>(
        &self,
        key: K,
        body: impl FnOnce(K, Option<V>, &mut Vec<SegmentId>) -> Result<T>,
    ) -> Result<T> {
        let shared = &self.shared;
        shared.check_writable()?;
        let mut moved = Vec::new();
        let result = loop {
            let stored = shared.snapshot(false);
            let on_disk = stored.try_get_disk(&key)?;
            let _update = shared.update_lock.lock();
            let current = shared.snapshot(true);
            if current.disk_ids() != stored.disk_ids() {
                log::trace!("Disk tiers changed under an atomic operation, retrying");
                continue;
            }
            let value = current
                .try_get_memory(&key)
                .or(on_disk)
                .filter(|value| !shared.options.deletion.is_deleted(value));
            break body(key, value, &mut moved);
        };
        for id in moved {
            self.shared.emit_segment_zero_moved_forward(id);
        }
        result
    }

    /// Insert `key` only if it has no live value.
    pub fn try_atomic_add(&self, key: K, value: V) -> Result<Option<OpIndex>> {
        self.atomically(key, |key, current, moved| {
            if current.is_some() {
                return Ok(None);
            }
            self.shared.upsert(key, value, true, moved).map(Some)
        })
    }

    /// Replace the value of `key` only if it has a live value.
    pub fn try_atomic_update(&self, key: K, value: V) -> Result<Option<OpIndex>> {
        self.atomically(key, |key, current, moved| {
            if current.is_none() {
                return Ok(None);
            }
            self.shared.upsert(key, value, true, moved).map(Some)
        })
    }

    /// Insert `value_to_add` if `key` has no live value, otherwise apply
    /// `update` to the current value.
    pub fn try_atomic_add_or_update<F>(&self, key: K, value_to_add: V, update: F) -> Result<OpIndex>
    where
        F: FnOnce(&mut V),
    {
        self.atomically(key, |key, current, moved| {
            let value = match current {
                Some(mut current) => {
                    update(&mut current);
                    current
                }
                None => value_to_add,
            };
            self.shared.upsert(key, value, true, moved)
        })
    }

    /// Number of live keys over a consistent snapshot of every tier.
    pub fn count(&self) -> Result<usize> {
        self.shared.count()
    }

    /// Number of live keys, counted by iterating every tier.
    pub fn count_full_scan(&self) -> Result<usize> {
        self.shared.count_snapshot(self.shared.snapshot(true))
    }

    pub fn create_iterator(&self, mode: IteratorMode) -> Result<StrataIterator<K, V>> {
        self.create_iterator_with(mode, false, false)
    }

    pub fn create_reverse_iterator(&self, mode: IteratorMode) -> Result<StrataIterator<K, V>> {
        self.create_iterator_with(mode, true, false)
    }

    /// Iterator with explicit direction; `include_deleted_records` also
    /// yields tombstones.
    pub fn create_iterator_with(
        &self,
        mode: IteratorMode,
        reverse: bool,
        include_deleted_records: bool,
    ) -> Result<StrataIterator<K, V>> {
        self.shared.metrics.increment(Counter::Iterators);
        StrataIterator::new(self.shared.clone(), mode, reverse, include_deleted_records)
    }

    /// Freeze segment zero into the read-only queue. Returns false if it
    /// was empty.
    pub fn move_segment_zero_forward(&self) -> Result<bool> {
        self.shared.move_segment_zero_forward()
    }

    /// Start merging the read-only queue into the disk segment on a
    /// background thread.
    pub fn start_merge_operation(&self) -> MergeHandle {
        self.shared.start_merge(MergeJob::Top)
    }

    /// Start merging bottom segments `from..=to` (0 is the oldest).
    pub fn start_bottom_segments_merge_operation(&self, from: usize, to: usize) -> MergeHandle {
        self.shared.start_merge(MergeJob::Bottom { from, to })
    }

    /// Merge the read-only queue and wait for the result.
    pub fn merge(&self) -> MergeResult {
        self.start_merge_operation().join()
    }

    /// Ask a running merge to stop. Returns false if none is running.
    pub fn try_cancel_merge_operation(&self) -> bool {
        if !self.shared.merging.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.cancel_merge.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_merging(&self) -> bool {
        self.shared.merging.load(Ordering::SeqCst)
    }

    /// Reject every further write with [`StrataError::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        self.shared.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::SeqCst)
    }

    /// Op index of the most recent write.
    pub fn op_index(&self) -> OpIndex {
        self.shared.op_index.load(Ordering::SeqCst)
    }

    pub fn segment_zero_id(&self) -> SegmentId {
        self.shared.segment_zero().id()
    }

    pub fn segment_zero_len(&self) -> usize {
        self.shared.segment_zero().len()
    }

    pub fn read_only_segment_ids(&self) -> Vec<SegmentId> {
        self.shared
            .topology
            .read()
            .read_only
            .iter()
            .map(|s| s.id())
            .collect()
    }

    pub fn read_only_segments_count(&self) -> usize {
        self.shared.topology.read().read_only.len()
    }

    pub fn read_only_segments_record_count(&self) -> usize {
        self.shared
            .topology
            .read()
            .read_only
            .iter()
            .map(|s| s.len())
            .sum()
    }

    pub fn disk_segment_id(&self) -> SegmentId {
        self.shared.topology.read().disk.id()
    }

    pub fn disk_segment_len(&self) -> usize {
        self.shared.topology.read().disk.len()
    }

    /// Storage units of the disk segment: its parts, or the segment itself.
    pub fn disk_segment_part_ids(&self) -> Vec<SegmentId> {
        self.shared.topology.read().disk.part_ids()
    }

    pub fn bottom_segment_ids(&self) -> Vec<SegmentId> {
        self.shared
            .topology
            .read()
            .bottom
            .iter()
            .map(|s| s.id())
            .collect()
    }

    pub fn bottom_segments_count(&self) -> usize {
        self.shared.topology.read().bottom.len()
    }

    pub fn bottom_segments_record_count(&self) -> usize {
        self.shared
            .topology
            .read()
            .bottom
            .iter()
            .map(|s| s.len())
            .sum()
    }

    pub fn on_segment_zero_moved_forward<F>(&self, handler: F)
    where
        F: Fn(SegmentId) + Send + Sync + 'static,
    {
        self.shared
            .events
            .write()
            .segment_zero_moved_forward
            .push(Arc::new(handler));
    }

    pub fn on_merge_operation_ended<F>(&self, handler: F)
    where
        F: Fn(MergeResult) + Send + Sync + 'static,
    {
        self.shared
            .events
            .write()
            .merge_operation_ended
            .push(Arc::new(handler));
    }

    pub fn on_disk_segment_created<F>(&self, handler: F)
    where
        F: Fn(SegmentId) + Send + Sync + 'static,
    {
        self.shared
            .events
            .write()
            .disk_segment_created
            .push(Arc::new(handler));
    }

    pub fn on_can_not_drop_read_only_segment<F>(&self, handler: F)
    where
        F: Fn(SegmentId, &StrataError) + Send + Sync + 'static,
    {
        self.shared
            .events
            .write()
            .can_not_drop_read_only_segment
            .push(Arc::new(handler));
    }

    pub fn on_can_not_drop_disk_segment<F>(&self, handler: F)
    where
        F: Fn(SegmentId, &StrataError) + Send + Sync + 'static,
    {
        self.shared
            .events
            .write()
            .can_not_drop_disk_segment
            .push(Arc::new(handler));
    }
}
