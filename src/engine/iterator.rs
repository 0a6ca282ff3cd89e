//! STRATA - Cross-Segment Iterator
//! One ordered, seekable stream over every tier of the engine.
//!
//! Sources are numbered newest first (mutable segment, read-only queue
//! from the tail, disk segment, bottom segments from the newest) and kept
//! in a heap ordered by `(key, source index)`, reversed on the key for
//! reverse iteration. The first copy of a key popped from the heap is the
//! most recent one; later copies are skipped.

use std::cmp::Ordering;
use std::sync::Arc;

use super::heap::{HeapEntry, MinHeap};
use super::merge::SourceIterator;
use super::seekable::SeekableIterator;
use super::Shared;
use crate::error::{Result, StrataError};
use crate::types::{IteratorMode, Record};

type EntryOrder<K, V> = Box<dyn Fn(&HeapEntry<K, V>, &HeapEntry<K, V>) -> Ordering + Send + Sync>;

pub struct StrataIterator<K: Record, V: Record + Default> {
    shared: Arc<Shared<K, V>>,
    mode: IteratorMode,
    reverse: bool,
    include_deleted_records: bool,
    sources: Vec<SourceIterator<K, V>>,
    heap: MinHeap<HeapEntry<K, V>, EntryOrder<K, V>>,
    generation: u64,
    /// Last key popped; copies of it in older sources are skipped.
    previous: Option<K>,
    seek_key: Option<K>,
    positioned: bool,
}

impl<K: Record, V: Record + Default> StrataIterator<K, V> {
    pub(crate) fn new(
        shared: Arc<Shared<K, V>>,
        mode: IteratorMode,
        reverse: bool,
        include_deleted_records: bool,
    ) -> Result<Self> {
        if mode == IteratorMode::Snapshot {
            shared.move_segment_zero_forward()?;
        }
        let comparer = shared.options.comparer.clone();
        let order: EntryOrder<K, V> = if reverse {
            Box::new(move |a, b| {
                comparer
                    .compare(&b.key, &a.key)
                    .then(a.source.cmp(&b.source))
            })
        } else {
            Box::new(move |a, b| {
                comparer
                    .compare(&a.key, &b.key)
                    .then(a.source.cmp(&b.source))
            })
        };
        let mut iterator = Self {
            shared,
            mode,
            reverse,
            include_deleted_records,
            sources: Vec::new(),
            heap: MinHeap::with_capacity(8, order),
            generation: 0,
            previous: None,
            seek_key: None,
            positioned: false,
        };
        iterator.load_sources()?;
        Ok(iterator)
    }

    fn load_sources(&mut self) -> Result<()> {
        let snapshot = self.shared.snapshot(self.mode.includes_mutable_segment());
        if matches!(
            self.mode,
            IteratorMode::Snapshot | IteratorMode::ReadOnlyRegion
        ) {
            let timeout = self.shared.options.config.freeze_wait_timeout;
            for segment in &snapshot.read_only {
                if !segment.wait_fully_frozen(timeout)? {
                    return Err(StrataError::ReadOnlySegmentsNotReady);
                }
            }
        }
        self.generation = snapshot.generation;
        self.sources = snapshot.sources();
        self.heap.clear();
        self.positioned = false;
        Ok(())
    }

    pub fn mode(&self) -> IteratorMode {
        self.mode
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        let entry = if self.reverse {
            self.sources[source].prev_entry()?
        } else {
            self.sources[source].next_entry()?
        };
        if let Some((key, value)) = entry {
            self.heap.push(HeapEntry { key, value, source });
        }
        Ok(())
    }

    fn rebuild_heap(&mut self) -> Result<()> {
        self.heap.clear();
        for source in 0..self.sources.len() {
            self.refill(source)?;
        }
        self.positioned = true;
        Ok(())
    }

    fn position_sources(&mut self, key: Option<&K>) -> Result<()> {
        for source in &mut self.sources {
            match (key, self.reverse) {
                (None, false) => source.seek_first(),
                (None, true) => source.seek_last(),
                (Some(key), false) => source.seek_ge(key)?,
                (Some(key), true) => source.seek_le(key)?,
            }
        }
        self.rebuild_heap()
    }

    /// Restart from the smallest key, or the largest in reverse.
    pub fn seek_first(&mut self) -> Result<()> {
        self.previous = None;
        self.seek_key = None;
        self.position_sources(None)
    }

    /// Position so the next entry is the first key `>= key`, or the last
    /// key `<= key` in reverse.
    pub fn seek(&mut self, key: &K) -> Result<()> {
        self.previous = None;
        self.seek_key = Some(key.clone());
        self.position_sources(Some(key))
    }

    /// Take a fresh snapshot and continue after the last returned key.
    fn refresh(&mut self) -> Result<()> {
        self.load_sources()?;
        let anchor = self.previous.clone().or_else(|| self.seek_key.clone());
        match anchor {
            Some(key) => self.position_sources(Some(&key)),
            None => self.position_sources(None),
        }
    }

    pub fn next_entry(&mut self) -> Result<Option<(K, V)>> {
        if self.mode == IteratorMode::AutoRefresh && self.shared.generation() != self.generation {
            self.refresh()?;
        }
        if !self.positioned {
            self.position_sources(None)?;
        }
        let comparer = self.shared.options.comparer.clone();
        let deletion = self.shared.options.deletion.clone();
        while let Some(top) = self.heap.pop() {
            self.refill(top.source)?;
            if let Some(previous) = &self.previous {
                if comparer.compare(previous, &top.key) == Ordering::Equal {
                    continue;
                }
            }
            self.previous = Some(top.key.clone());
            if !self.include_deleted_records && deletion.is_deleted(&top.value) {
                continue;
            }
            return Ok(Some((top.key, top.value)));
        }
        Ok(None)
    }
}

impl<K: Record, V: Record + Default> Iterator for StrataIterator<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
