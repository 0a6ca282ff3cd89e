//! STRATA - Merge Engine
//! k-way merge of sorted segments into a new disk segment.
//!
//! ## Algorithm
//! One source iterator per input segment, ordered newest first, feeds a
//! min-heap keyed by `(key, source index)`. Popping the heap yields keys in
//! order and, for equal keys, the most recent write first:
//!
//! - a key equal to the previous one is a superseded copy and is dropped;
//! - a tombstone is dropped when the merge covers the oldest tier,
//!   otherwise written through so it keeps shadowing older data;
//! - anything else is appended to the output.
//!
//! ## Part skip
//! When the oldest source is a multi-part disk segment and the heap top is
//! the first entry of one of its parts, the whole part is spliced into the
//! output unchanged if nothing from a newer source falls inside it. The
//! source then jumps past the part.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use super::disk::creator::SegmentCreator;
use super::disk::iterator::DiskSegmentIterator;
use super::disk::DiskSegment;
use super::heap::{HeapEntry, MinHeap};
use super::map::MapIterator;
use super::seekable::SeekableIterator;
use crate::comparer::SharedComparer;
use crate::error::Result;
use crate::options::EngineOptions;
use crate::types::Record;

/// A seekable iterator over one segment of any tier.
pub enum SourceIterator<K: Record, V: Record> {
    Memory(MapIterator<K, V>),
    Disk(DiskSegmentIterator<K, V>),
}

impl<K: Record, V: Record> SeekableIterator<K, V> for SourceIterator<K, V> {
    fn seek_first(&mut self) {
        match self {
            SourceIterator::Memory(it) => it.seek_first(),
            SourceIterator::Disk(it) => it.seek_first(),
        }
    }

    fn seek_last(&mut self) {
        match self {
            SourceIterator::Memory(it) => it.seek_last(),
            SourceIterator::Disk(it) => it.seek_last(),
        }
    }

    fn seek_ge(&mut self, key: &K) -> Result<()> {
        match self {
            SourceIterator::Memory(it) => it.seek_ge(key),
            SourceIterator::Disk(it) => it.seek_ge(key),
        }
    }

    fn seek_le(&mut self, key: &K) -> Result<()> {
        match self {
            SourceIterator::Memory(it) => it.seek_le(key),
            SourceIterator::Disk(it) => it.seek_le(key),
        }
    }

    fn next_entry(&mut self) -> Result<Option<(K, V)>> {
        match self {
            SourceIterator::Memory(it) => it.next_entry(),
            SourceIterator::Disk(it) => it.next_entry(),
        }
    }

    fn prev_entry(&mut self) -> Result<Option<(K, V)>> {
        match self {
            SourceIterator::Memory(it) => it.prev_entry(),
            SourceIterator::Disk(it) => it.prev_entry(),
        }
    }
}

/// Counters of one merge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Entries appended one by one.
    pub written: u64,
    /// Tombstones and superseded copies dropped.
    pub dropped: u64,
    /// Parts spliced in unchanged.
    pub skipped_parts: u64,
    /// Entries carried by the spliced parts.
    pub skipped_records: u64,
}

pub enum MergeOutcome<K, V> {
    Completed(DiskSegment<K, V>, MergeStats),
    Cancelled,
}

/// Orders heap entries by key, then by source index (lower is newer).
pub(crate) fn entry_order<K, V>(
    comparer: SharedComparer<K>,
) -> impl Fn(&HeapEntry<K, V>, &HeapEntry<K, V>) -> Ordering {
    move |a, b| {
        comparer
            .compare(&a.key, &b.key)
            .then(a.source.cmp(&b.source))
    }
}

fn refill<K, V, F>(
    sources: &mut [SourceIterator<K, V>],
    heap: &mut MinHeap<HeapEntry<K, V>, F>,
    source: usize,
) -> Result<()>
where
    K: Record,
    V: Record,
    F: Fn(&HeapEntry<K, V>, &HeapEntry<K, V>) -> Ordering,
{
    if let Some((key, value)) = sources[source].next_entry()? {
        heap.push(HeapEntry { key, value, source });
    }
    Ok(())
}

/// Visit the newest copy of every key across `sources` (newest first),
/// tombstones included.
pub(crate) fn for_each_latest<K, V, F>(
    mut sources: Vec<SourceIterator<K, V>>,
    comparer: SharedComparer<K>,
    mut visit: F,
) -> Result<()>
where
    K: Record,
    V: Record,
    F: FnMut(K, V) -> Result<()>,
{
    let mut heap = MinHeap::with_capacity(sources.len(), entry_order(comparer.clone()));
    for source in 0..sources.len() {
        sources[source].seek_first();
        refill(&mut sources, &mut heap, source)?;
    }
    let mut previous: Option<K> = None;
    while let Some(top) = heap.pop() {
        refill(&mut sources, &mut heap, top.source)?;
        if let Some(p) = &previous {
            if comparer.compare(p, &top.key) == Ordering::Equal {
                continue;
            }
        }
        previous = Some(top.key.clone());
        visit(top.key, top.value)?;
    }
    Ok(())
}

/// Merge `sources` (newest first) into `creator`. On success the output is
/// sealed; on cancellation or error it is discarded and no storage of the
/// inputs is touched.
pub fn run_merge<K: Record, V: Record>(
    mut sources: Vec<SourceIterator<K, V>>,
    mut creator: SegmentCreator<K, V>,
    options: &EngineOptions<K, V>,
    drop_tombstones: bool,
    cancel: &AtomicBool,
) -> Result<MergeOutcome<K, V>> {
    let output_id = creator.id();
    match merge_into(&mut sources, &mut creator, options, drop_tombstones, cancel) {
        Ok(Some(stats)) => {
            drop(sources);
            if creator.is_empty() {
                creator.discard()?;
                return Ok(MergeOutcome::Completed(DiskSegment::empty(), stats));
            }
            Ok(MergeOutcome::Completed(creator.seal()?, stats))
        }
        Ok(None) => {
            creator.discard()?;
            Ok(MergeOutcome::Cancelled)
        }
        Err(err) => {
            if let Err(discard_err) = creator.discard() {
                log::warn!(
                    "Failed to discard output segment {}: {}",
                    output_id,
                    discard_err
                );
            }
            Err(err)
        }
    }
}

/// The merge loop. Returns `None` if cancelled.
fn merge_into<K: Record, V: Record>(
    sources: &mut [SourceIterator<K, V>],
    creator: &mut SegmentCreator<K, V>,
    options: &EngineOptions<K, V>,
    drop_tombstones: bool,
    cancel: &AtomicBool,
) -> Result<Option<MergeStats>> {
    let comparer = options.comparer.clone();
    let deletion = options.deletion.clone();
    let minimum_part_length = options.config.minimum_record_count;

    let mut heap = MinHeap::with_capacity(sources.len(), entry_order(comparer.clone()));
    for source in 0..sources.len() {
        sources[source].seek_first();
        refill(sources, &mut heap, source)?;
    }

    // Only the oldest source can have parts reused: every newer source
    // shadows it.
    let skip_source = match sources.last() {
        Some(SourceIterator::Disk(it)) if it.segment().is_multi_part() => Some(sources.len() - 1),
        _ => None,
    };

    let mut stats = MergeStats::default();
    let mut previous: Option<K> = None;

    while let Some(top) = heap.pop() {
        if cancel.load(AtomicOrdering::SeqCst) {
            return Ok(None);
        }

        if Some(top.source) == skip_source && creator.can_skip_current_part() {
            if let SourceIterator::Disk(it) = &mut sources[top.source] {
                let position = (it.position() - 1) as usize;
                let segment = it.segment().clone();
                if let Some(multi) = segment.as_multi_part() {
                    if multi.is_beginning_of_a_part(position) {
                        let (part_index, _) = multi.locate(position)?;
                        let part = multi.part(part_index).clone();
                        let boundary = multi.part_boundary(part_index);
                        let after_previous = previous.as_ref().map_or(true, |p| {
                            comparer.compare(p, &boundary.first_key) != Ordering::Equal
                        });
                        let below_heap = heap.peek().map_or(true, |next| {
                            comparer.compare(&boundary.last_key, &next.key) == Ordering::Less
                        });
                        let keeps_tombstones = drop_tombstones && part.has_tombstones();
                        if part.len() > minimum_part_length
                            && after_previous
                            && below_heap
                            && !keeps_tombstones
                        {
                            log::debug!(
                                "Reusing part {} ({} records) of segment {}",
                                part.id(),
                                part.len(),
                                multi.id()
                            );
                            stats.skipped_parts += 1;
                            stats.skipped_records += part.len() as u64;
                            previous = Some(boundary.last_key.clone());
                            it.set_position((multi.part_start(part_index) + part.len()) as i64);
                            creator.append_part(part, boundary)?;
                            refill(sources, &mut heap, top.source)?;
                            continue;
                        }
                    }
                }
            }
        }

        let superseded = previous
            .as_ref()
            .map_or(false, |p| comparer.compare(p, &top.key) == Ordering::Equal);
        if superseded {
            stats.dropped += 1;
        } else if drop_tombstones && deletion.is_deleted(&top.value) {
            stats.dropped += 1;
            previous = Some(top.key);
        } else {
            creator.append(&top.key, &top.value)?;
            stats.written += 1;
            previous = Some(top.key);
        }
        refill(sources, &mut heap, top.source)?;
    }
    Ok(Some(stats))
}
