//! STRATA - Disk Segments
//! Immutable sorted runs produced by merges.
//!
//! A [`DiskSegment`] wraps either layout and tracks its readers. Dropping
//! a segment that is still being read is deferred until the last reader
//! leaves; failures of a deferred drop are handed to a reporter callback
//! instead of the caller that released the segment.

pub mod creator;
pub mod iterator;
pub mod meta;
pub mod multi;
pub mod single;

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use self::meta::DiskSegmentMeta;
use self::multi::MultiPartSegment;
use self::single::SinglePartSegment;
use crate::error::{Result, StrataError};
use crate::options::EngineOptions;
use crate::types::{Record, SegmentId, EMPTY_SEGMENT_ID};

/// Receives the error of a drop that could not complete.
pub type DropFailureReporter = Arc<dyn Fn(SegmentId, &StrataError) + Send + Sync>;

enum Kind<K, V> {
    Empty,
    Single(Arc<SinglePartSegment<K, V>>),
    Multi(MultiPartSegment<K, V>),
}

#[derive(Default)]
struct ReaderState {
    readers: usize,
    drop_requested: bool,
    dropped: bool,
    exclusions: HashSet<SegmentId>,
    reporter: Option<DropFailureReporter>,
}

pub struct DiskSegment<K, V> {
    id: SegmentId,
    kind: Kind<K, V>,
    state: Mutex<ReaderState>,
}

impl<K: Record, V: Record> DiskSegment<K, V> {
    /// The segment every engine starts from.
    pub fn empty() -> Self {
        Self::with_kind(EMPTY_SEGMENT_ID, Kind::Empty)
    }

    pub fn from_single(segment: SinglePartSegment<K, V>) -> Self {
        Self::with_kind(segment.id(), Kind::Single(Arc::new(segment)))
    }

    pub fn from_multi(segment: MultiPartSegment<K, V>) -> Self {
        Self::with_kind(segment.id(), Kind::Multi(segment))
    }

    fn with_kind(id: SegmentId, kind: Kind<K, V>) -> Self {
        Self {
            id,
            kind,
            state: Mutex::new(ReaderState::default()),
        }
    }

    /// Reopen a sealed segment. Id 0 is the empty segment.
    pub fn open(id: SegmentId, options: Arc<EngineOptions<K, V>>) -> Result<Self> {
        if id == EMPTY_SEGMENT_ID {
            return Ok(Self::empty());
        }
        match meta::read(&options.device_manager, id)? {
            DiskSegmentMeta::Single { .. } => Ok(Self::from_single(SinglePartSegment::open(
                id, options,
            )?)),
            DiskSegmentMeta::Multi { .. } => {
                Ok(Self::from_multi(MultiPartSegment::open(id, options)?))
            }
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn len(&self) -> usize {
        match &self.kind {
            Kind::Empty => 0,
            Kind::Single(s) => s.len(),
            Kind::Multi(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_tombstones(&self) -> bool {
        match &self.kind {
            Kind::Empty => false,
            Kind::Single(s) => s.has_tombstones(),
            Kind::Multi(m) => m.has_tombstones(),
        }
    }

    pub fn is_multi_part(&self) -> bool {
        matches!(self.kind, Kind::Multi(_))
    }

    pub fn as_multi_part(&self) -> Option<&MultiPartSegment<K, V>> {
        match &self.kind {
            Kind::Multi(m) => Some(m),
            _ => None,
        }
    }

    /// Ids of the storage units this segment owns: its parts, or itself.
    pub fn part_ids(&self) -> Vec<SegmentId> {
        match &self.kind {
            Kind::Empty => Vec::new(),
            Kind::Single(s) => vec![s.id()],
            Kind::Multi(m) => m.part_ids(),
        }
    }

    fn out_of_range(&self, position: usize) -> StrataError {
        StrataError::Corruption(format!(
            "index {} out of range for segment {} of length {}",
            position,
            self.id,
            self.len()
        ))
    }

    pub fn get_key(&self, position: usize) -> Result<K> {
        match &self.kind {
            Kind::Empty => Err(self.out_of_range(position)),
            Kind::Single(s) => s.get_key(position),
            Kind::Multi(m) => m.get_key(position),
        }
    }

    pub fn get_value(&self, position: usize) -> Result<V> {
        match &self.kind {
            Kind::Empty => Err(self.out_of_range(position)),
            Kind::Single(s) => s.get_value(position),
            Kind::Multi(m) => m.get_value(position),
        }
    }

    pub fn read_entry(&self, position: usize) -> Result<(K, V)> {
        match &self.kind {
            Kind::Empty => Err(self.out_of_range(position)),
            Kind::Single(s) => s.read_entry(position),
            Kind::Multi(m) => m.read_entry(position),
        }
    }

    /// First position whose key is >= `key`; `len()` if there is none.
    pub fn first_greater_or_equal_position(&self, key: &K) -> Result<usize> {
        match &self.kind {
            Kind::Empty => Ok(0),
            Kind::Single(s) => s.first_greater_or_equal_position(key),
            Kind::Multi(m) => m.first_greater_or_equal_position(key),
        }
    }

    pub fn last_smaller_or_equal_position(&self, key: &K) -> Result<Option<usize>> {
        match &self.kind {
            Kind::Empty => Ok(None),
            Kind::Single(s) => s.last_smaller_or_equal_position(key),
            Kind::Multi(m) => m.last_smaller_or_equal_position(key),
        }
    }

    /// Raw lookup: a stored tombstone is returned as a value.
    pub fn try_get(&self, key: &K) -> Result<Option<V>> {
        match &self.kind {
            Kind::Empty => Ok(None),
            Kind::Single(s) => s.try_get(key),
            Kind::Multi(m) => m.try_get(key),
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        match &self.kind {
            Kind::Empty => Ok(false),
            Kind::Single(s) => s.contains_key(key),
            Kind::Multi(m) => m.contains_key(key),
        }
    }

    pub fn add_reader(&self) {
        self.state.lock().readers += 1;
    }

    /// Release a reader. The last reader out performs a pending drop.
    pub fn remove_reader(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.readers = state.readers.saturating_sub(1);
            if state.readers == 0 && state.drop_requested && !state.dropped {
                state.dropped = true;
                Some((std::mem::take(&mut state.exclusions), state.reporter.take()))
            } else {
                None
            }
        };
        if let Some((exclusions, reporter)) = pending {
            self.run_drop(&exclusions, reporter.as_ref());
        }
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    pub fn is_drop_requested(&self) -> bool {
        self.state.lock().drop_requested
    }

    pub fn is_dropped(&self) -> bool {
        self.state.lock().dropped
    }

    /// Schedule deletion of the segment's storage, skipping the parts in
    /// `exclusions`. Runs now if nobody is reading, otherwise when the
    /// last reader leaves.
    pub fn request_drop(&self, exclusions: HashSet<SegmentId>, reporter: Option<DropFailureReporter>) {
        let run_now = {
            let mut state = self.state.lock();
            if state.drop_requested {
                return;
            }
            state.drop_requested = true;
            if state.readers == 0 {
                state.dropped = true;
                true
            } else {
                state.exclusions = exclusions.clone();
                state.reporter = reporter.clone();
                false
            }
        };
        if run_now {
            self.run_drop(&exclusions, reporter.as_ref());
        } else {
            log::debug!(
                "Drop of disk segment {} deferred until its readers finish",
                self.id
            );
        }
    }

    fn run_drop(&self, exclusions: &HashSet<SegmentId>, reporter: Option<&DropFailureReporter>) {
        if let Err(err) = self.drop_storage(exclusions) {
            log::error!("Failed to drop disk segment {}: {}", self.id, err);
            if let Some(report) = reporter {
                report(self.id, &err);
            }
        } else {
            log::debug!("Dropped disk segment {}", self.id);
        }
    }

    fn drop_storage(&self, exclusions: &HashSet<SegmentId>) -> Result<()> {
        match &self.kind {
            Kind::Empty => Ok(()),
            Kind::Single(s) if exclusions.contains(&s.id()) => Ok(()),
            Kind::Single(s) => s.drop_storage(),
            Kind::Multi(m) => m.drop_storage(exclusions),
        }
    }
}

/// A registered reader of a disk segment, released on drop.
pub struct DiskSegmentReader<K: Record, V: Record> {
    segment: Arc<DiskSegment<K, V>>,
}

impl<K: Record, V: Record> DiskSegmentReader<K, V> {
    pub fn new(segment: Arc<DiskSegment<K, V>>) -> Self {
        segment.add_reader();
        Self { segment }
    }

    pub fn segment(&self) -> &Arc<DiskSegment<K, V>> {
        &self.segment
    }
}

impl<K: Record, V: Record> Clone for DiskSegmentReader<K, V> {
    fn clone(&self) -> Self {
        Self::new(self.segment.clone())
    }
}

impl<K: Record, V: Record> Deref for DiskSegmentReader<K, V> {
    type Target = DiskSegment<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.segment
    }
}

impl<K: Record, V: Record> Drop for DiskSegmentReader<K, V> {
    fn drop(&mut self) {
        self.segment.remove_reader();
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::sync::Arc;

    use crate::comparer::NaturalComparer;
    use crate::config::Config;
    use crate::device::MemoryDeviceManager;
    use crate::engine::map::BTreeMapFactory;
    use crate::options::{EngineOptions, FnDeletionPolicy, OptionDeletionPolicy};
    use crate::serializer::BincodeSerializer;

    /// `u64 -> i64` with fixed-size records; `-1` is the tombstone.
    pub fn fixed_options(step: usize) -> Arc<EngineOptions<u64, i64>> {
        Arc::new(EngineOptions {
            config: Config::new("unused").with_sparse_index_step(step),
            comparer: Arc::new(NaturalComparer),
            key_serializer: Arc::new(BincodeSerializer::fixed(8)),
            value_serializer: Arc::new(BincodeSerializer::fixed(8)),
            deletion: Arc::new(FnDeletionPolicy::new(
                |v: &i64| *v == -1,
                |v: &mut i64| *v = -1,
            )),
            device_manager: Arc::new(MemoryDeviceManager::new()),
            map_factory: Arc::new(BTreeMapFactory),
        })
    }

    /// `String -> Option<u32>` with variable-size records.
    pub fn string_options(step: usize) -> Arc<EngineOptions<String, Option<u32>>> {
        Arc::new(EngineOptions {
            config: Config::new("unused").with_sparse_index_step(step),
            comparer: Arc::new(NaturalComparer),
            key_serializer: Arc::new(BincodeSerializer::new()),
            value_serializer: Arc::new(BincodeSerializer::new()),
            deletion: Arc::new(OptionDeletionPolicy),
            device_manager: Arc::new(MemoryDeviceManager::new()),
            map_factory: Arc::new(BTreeMapFactory),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::creator::SinglePartCreator;
    use super::tests_support::fixed_options;
    use super::*;
    use crate::device::DeviceCategory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn build(id: SegmentId, options: Arc<EngineOptions<u64, i64>>) -> Arc<DiskSegment<u64, i64>> {
        let mut creator = SinglePartCreator::new(id, options).unwrap();
        for k in 0..10u64 {
            creator.append(&k, &(k as i64)).unwrap();
        }
        Arc::new(DiskSegment::from_single(creator.seal().unwrap()))
    }

    #[test]
    fn test_empty_segment() {
        let segment: DiskSegment<u64, i64> = DiskSegment::empty();
        assert_eq!(segment.id(), EMPTY_SEGMENT_ID);
        assert!(segment.is_empty());
        assert_eq!(segment.try_get(&1).unwrap(), None);
        assert_eq!(segment.first_greater_or_equal_position(&1).unwrap(), 0);
        assert!(segment.get_key(0).is_err());
    }

    #[test]
    fn test_drop_deferred_until_last_reader() {
        let options = fixed_options(4);
        let segment = build(5, options.clone());
        let reader = DiskSegmentReader::new(segment.clone());
        let second = reader.clone();
        assert_eq!(segment.reader_count(), 2);

        segment.request_drop(HashSet::new(), None);
        assert!(segment.is_drop_requested());
        assert!(!segment.is_dropped());
        assert_eq!(reader.try_get(&3).unwrap(), Some(3));

        drop(reader);
        assert!(options.device_manager.exists(5, DeviceCategory::DiskData));
        drop(second);
        assert!(segment.is_dropped());
        assert!(!options.device_manager.exists(5, DeviceCategory::DiskData));
    }

    #[test]
    fn test_drop_without_readers_is_immediate() {
        let options = fixed_options(4);
        let segment = build(6, options.clone());
        segment.request_drop(HashSet::new(), None);
        assert!(segment.is_dropped());
        assert!(!options.device_manager.exists(6, DeviceCategory::DiskMeta));
    }

    #[test]
    fn test_drop_honours_exclusions() {
        let options = fixed_options(4);
        let segment = build(7, options.clone());
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = reported.clone();
        let reporter: DropFailureReporter = Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        segment.request_drop([7].into_iter().collect(), Some(reporter));
        assert!(options.device_manager.exists(7, DeviceCategory::DiskData));
        assert_eq!(reported.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_open_dispatches_on_meta() {
        let options = fixed_options(4);
        build(8, options.clone());
        let reopened = DiskSegment::open(8, options.clone()).unwrap();
        assert!(!reopened.is_multi_part());
        assert_eq!(reopened.len(), 10);
        assert_eq!(reopened.part_ids(), vec![8]);
        assert!(DiskSegment::<u64, i64>::open(0, options).unwrap().is_empty());
    }
}
