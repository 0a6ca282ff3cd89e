//! STRATA - Ordered Maps
//! The sorted in-memory structure behind the mutable segment.
//!
//! The engine only depends on the [`OrderedMap`] capability. Concrete maps
//! are produced by an [`OrderedMapFactory`] chosen when the engine is
//! built: [`BTreeMapFactory`] for general use, [`SortedVecMapFactory`] for
//! small segments where contiguous storage wins.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::seekable::SeekableIterator;
use crate::comparer::SharedComparer;
use crate::error::Result;
use crate::options::DeletionPolicy;
use crate::types::{OperationResult, Record};

/// Thread-safe sorted map with a one-way freeze.
///
/// Writes after `freeze` return [`OperationResult::RetrySegmentIsFrozen`].
pub trait OrderedMap<K, V>: Send + Sync {
    fn upsert(&self, key: K, value: V) -> OperationResult;

    /// Stores a tombstone for `key`, marking the current value (or a
    /// default one) deleted.
    fn delete(&self, key: K, deletion: &dyn DeletionPolicy<V>) -> OperationResult;

    fn try_get(&self, key: &K) -> Option<V>;

    fn contains_key(&self, key: &K) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn freeze(&self);

    fn is_frozen(&self) -> bool;

    fn first(&self) -> Option<(K, V)>;

    fn last(&self) -> Option<(K, V)>;

    /// First entry with key >= `key`.
    fn seek_ge(&self, key: &K) -> Option<(K, V)>;

    /// Last entry with key <= `key`.
    fn seek_le(&self, key: &K) -> Option<(K, V)>;

    /// First entry with key > `key`.
    fn next_after(&self, key: &K) -> Option<(K, V)>;

    /// Last entry with key < `key`.
    fn prev_before(&self, key: &K) -> Option<(K, V)>;
}

pub type SharedOrderedMap<K, V> = Arc<dyn OrderedMap<K, V>>;

/// Builds empty maps ordered by the engine's comparer.
pub trait OrderedMapFactory<K, V>: Send + Sync {
    fn create(&self, comparer: SharedComparer<K>) -> SharedOrderedMap<K, V>;
}

pub type SharedMapFactory<K, V> = Arc<dyn OrderedMapFactory<K, V>>;

// ---------------------------------------------------------------------------
// B-tree map
// ---------------------------------------------------------------------------

/// A key carrying the comparer it sorts by.
struct ComparableKey<K> {
    key: K,
    comparer: SharedComparer<K>,
}

impl<K> PartialEq for ComparableKey<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K> Eq for ComparableKey<K> {}

impl<K> PartialOrd for ComparableKey<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for ComparableKey<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparer.compare(&self.key, &other.key)
    }
}

/// `BTreeMap` guarded by a reader-writer lock.
pub struct BTreeOrderedMap<K, V> {
    entries: RwLock<BTreeMap<ComparableKey<K>, V>>,
    comparer: SharedComparer<K>,
    frozen: AtomicBool,
}

impl<K: Record, V: Record + Default> BTreeOrderedMap<K, V> {
    pub fn new(comparer: SharedComparer<K>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            comparer,
            frozen: AtomicBool::new(false),
        }
    }

    fn wrap(&self, key: &K) -> ComparableKey<K> {
        ComparableKey {
            key: key.clone(),
            comparer: self.comparer.clone(),
        }
    }

    fn first_in(&self, lower: Bound<ComparableKey<K>>) -> Option<(K, V)> {
        let entries = self.entries.read();
        entries
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.key.clone(), v.clone()))
    }

    fn last_in(&self, upper: Bound<ComparableKey<K>>) -> Option<(K, V)> {
        let entries = self.entries.read();
        entries
            .range((Bound::Unbounded, upper))
            .next_back()
            .map(|(k, v)| (k.key.clone(), v.clone()))
    }
}

impl<K: Record, V: Record + Default> OrderedMap<K, V> for BTreeOrderedMap<K, V> {
    fn upsert(&self, key: K, value: V) -> OperationResult {
        let mut entries = self.entries.write();
        if self.frozen.load(AtomicOrdering::Acquire) {
            return OperationResult::RetrySegmentIsFrozen;
        }
        let key = ComparableKey {
            key,
            comparer: self.comparer.clone(),
        };
        match entries.insert(key, value) {
            Some(_) => OperationResult::Updated,
            None => OperationResult::Added,
        }
    }

    fn delete(&self, key: K, deletion: &dyn DeletionPolicy<V>) -> OperationResult {
        let mut entries = self.entries.write();
        if self.frozen.load(AtomicOrdering::Acquire) {
            return OperationResult::RetrySegmentIsFrozen;
        }
        let key = ComparableKey {
            key,
            comparer: self.comparer.clone(),
        };
        match entries.get_mut(&key) {
            Some(value) => {
                deletion.mark_deleted(value);
                OperationResult::Updated
            }
            None => {
                let mut value = V::default();
                deletion.mark_deleted(&mut value);
                entries.insert(key, value);
                OperationResult::Added
            }
        }
    }

    fn try_get(&self, key: &K) -> Option<V> {
        self.entries.read().get(&self.wrap(key)).cloned()
    }

    fn contains_key(&self, key: &K) -> bool {
        self.entries.read().contains_key(&self.wrap(key))
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn freeze(&self) {
        let _entries = self.entries.write();
        self.frozen.store(true, AtomicOrdering::Release);
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(AtomicOrdering::Acquire)
    }

    fn first(&self) -> Option<(K, V)> {
        self.first_in(Bound::Unbounded)
    }

    fn last(&self) -> Option<(K, V)> {
        self.last_in(Bound::Unbounded)
    }

    fn seek_ge(&self, key: &K) -> Option<(K, V)> {
        self.first_in(Bound::Included(self.wrap(key)))
    }

    fn seek_le(&self, key: &K) -> Option<(K, V)> {
        self.last_in(Bound::Included(self.wrap(key)))
    }

    fn next_after(&self, key: &K) -> Option<(K, V)> {
        self.first_in(Bound::Excluded(self.wrap(key)))
    }

    fn prev_before(&self, key: &K) -> Option<(K, V)> {
        self.last_in(Bound::Excluded(self.wrap(key)))
    }
}

/// Produces [`BTreeOrderedMap`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct BTreeMapFactory;

impl<K: Record, V: Record + Default> OrderedMapFactory<K, V> for BTreeMapFactory {
    fn create(&self, comparer: SharedComparer<K>) -> SharedOrderedMap<K, V> {
        Arc::new(BTreeOrderedMap::new(comparer))
    }
}

// ---------------------------------------------------------------------------
// Sorted vector map
// ---------------------------------------------------------------------------

/// Entries kept in one sorted vector, located by binary search.
/// Inserts shift the tail, so it suits small mutable segments.
pub struct SortedVecMap<K, V> {
    entries: RwLock<Vec<(K, V)>>,
    comparer: SharedComparer<K>,
    frozen: AtomicBool,
}

impl<K: Record, V: Record + Default> SortedVecMap<K, V> {
    pub fn new(comparer: SharedComparer<K>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            comparer,
            frozen: AtomicBool::new(false),
        }
    }

    fn search(&self, entries: &[(K, V)], key: &K) -> std::result::Result<usize, usize> {
        entries.binary_search_by(|(k, _)| self.comparer.compare(k, key))
    }

    fn at(entries: &[(K, V)], index: usize) -> Option<(K, V)> {
        entries.get(index).cloned()
    }
}

impl<K: Record, V: Record + Default> OrderedMap<K, V> for SortedVecMap<K, V> {
    fn upsert(&self, key: K, value: V) -> OperationResult {
        let mut entries = self.entries.write();
        if self.frozen.load(AtomicOrdering::Acquire) {
            return OperationResult::RetrySegmentIsFrozen;
        }
        match self.search(&entries, &key) {
            Ok(index) => {
                entries[index].1 = value;
                OperationResult::Updated
            }
            Err(index) => {
                entries.insert(index, (key, value));
                OperationResult::Added
            }
        }
    }

    fn delete(&self, key: K, deletion: &dyn DeletionPolicy<V>) -> OperationResult {
        let mut entries = self.entries.write();
        if self.frozen.load(AtomicOrdering::Acquire) {
            return OperationResult::RetrySegmentIsFrozen;
        }
        match self.search(&entries, &key) {
            Ok(index) => {
                deletion.mark_deleted(&mut entries[index].1);
                OperationResult::Updated
            }
            Err(index) => {
                let mut value = V::default();
                deletion.mark_deleted(&mut value);
                entries.insert(index, (key, value));
                OperationResult::Added
            }
        }
    }

    fn try_get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        self.search(&entries, key)
            .ok()
            .map(|index| entries[index].1.clone())
    }

    fn contains_key(&self, key: &K) -> bool {
        let entries = self.entries.read();
        self.search(&entries, key).is_ok()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn freeze(&self) {
        let _entries = self.entries.write();
        self.frozen.store(true, AtomicOrdering::Release);
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(AtomicOrdering::Acquire)
    }

    fn first(&self) -> Option<(K, V)> {
        Self::at(&self.entries.read(), 0)
    }

    fn last(&self) -> Option<(K, V)> {
        let entries = self.entries.read();
        entries.last().cloned()
    }

    fn seek_ge(&self, key: &K) -> Option<(K, V)> {
        let entries = self.entries.read();
        let index = match self.search(&entries, key) {
            Ok(i) | Err(i) => i,
        };
        Self::at(&entries, index)
    }

    fn seek_le(&self, key: &K) -> Option<(K, V)> {
        let entries = self.entries.read();
        match self.search(&entries, key) {
            Ok(i) => Self::at(&entries, i),
            Err(0) => None,
            Err(i) => Self::at(&entries, i - 1),
        }
    }

    fn next_after(&self, key: &K) -> Option<(K, V)> {
        let entries = self.entries.read();
        let index = match self.search(&entries, key) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        Self::at(&entries, index)
    }

    fn prev_before(&self, key: &K) -> Option<(K, V)> {
        let entries = self.entries.read();
        match self.search(&entries, key) {
            Ok(0) | Err(0) => None,
            Ok(i) | Err(i) => Self::at(&entries, i - 1),
        }
    }
}

/// Produces [`SortedVecMap`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortedVecMapFactory;

impl<K: Record, V: Record + Default> OrderedMapFactory<K, V> for SortedVecMapFactory {
    fn create(&self, comparer: SharedComparer<K>) -> SharedOrderedMap<K, V> {
        Arc::new(SortedVecMap::new(comparer))
    }
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

enum MapCursor<K> {
    First,
    Last,
    AtOrAfter(K),
    After(K),
    AtOrBefore(K),
    Before(K),
    Exhausted,
}

/// Cursor over a live map. Each step re-enters the map through its lock,
/// so entries written behind the cursor are observed while the map is
/// still mutable.
pub struct MapIterator<K, V> {
    map: SharedOrderedMap<K, V>,
    cursor: MapCursor<K>,
    _marker: PhantomData<fn() -> V>,
}

impl<K: Record, V: Record> MapIterator<K, V> {
    pub fn new(map: SharedOrderedMap<K, V>) -> Self {
        Self {
            map,
            cursor: MapCursor::First,
            _marker: PhantomData,
        }
    }
}

impl<K: Record, V: Record> SeekableIterator<K, V> for MapIterator<K, V> {
    fn seek_first(&mut self) {
        self.cursor = MapCursor::First;
    }

    fn seek_last(&mut self) {
        self.cursor = MapCursor::Last;
    }

    fn seek_ge(&mut self, key: &K) -> Result<()> {
        self.cursor = MapCursor::AtOrAfter(key.clone());
        Ok(())
    }

    fn seek_le(&mut self, key: &K) -> Result<()> {
        self.cursor = MapCursor::AtOrBefore(key.clone());
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<(K, V)>> {
        let found = match &self.cursor {
            MapCursor::First => self.map.first(),
            MapCursor::AtOrAfter(k) | MapCursor::AtOrBefore(k) => self.map.seek_ge(k),
            MapCursor::After(k) | MapCursor::Before(k) => self.map.next_after(k),
            MapCursor::Last | MapCursor::Exhausted => None,
        };
        self.cursor = match &found {
            Some((k, _)) => MapCursor::After(k.clone()),
            None => MapCursor::Exhausted,
        };
        Ok(found)
    }

    fn prev_entry(&mut self) -> Result<Option<(K, V)>> {
        let found = match &self.cursor {
            MapCursor::Last => self.map.last(),
            MapCursor::AtOrBefore(k) | MapCursor::AtOrAfter(k) => self.map.seek_le(k),
            MapCursor::Before(k) | MapCursor::After(k) => self.map.prev_before(k),
            MapCursor::First | MapCursor::Exhausted => None,
        };
        self.cursor = match &found {
            Some((k, _)) => MapCursor::Before(k.clone()),
            None => MapCursor::Exhausted,
        };
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::NaturalComparer;
    use crate::options::FnDeletionPolicy;

    fn maps() -> Vec<SharedOrderedMap<i32, i32>> {
        let comparer: SharedComparer<i32> = Arc::new(NaturalComparer);
        vec![
            BTreeMapFactory.create(comparer.clone()),
            SortedVecMapFactory.create(comparer),
        ]
    }

    #[test]
    fn test_upsert_statuses() {
        for map in maps() {
            assert_eq!(map.upsert(1, 10), OperationResult::Added);
            assert_eq!(map.upsert(1, 11), OperationResult::Updated);
            assert_eq!(map.try_get(&1), Some(11));
            assert_eq!(map.len(), 1);
        }
    }

    #[test]
    fn test_frozen_map_rejects_writes() {
        for map in maps() {
            map.upsert(1, 1);
            map.freeze();
            assert!(map.is_frozen());
            assert_eq!(map.upsert(2, 2), OperationResult::RetrySegmentIsFrozen);
            assert_eq!(map.len(), 1);
        }
    }

    #[test]
    fn test_delete_writes_tombstone() {
        let policy = FnDeletionPolicy::new(|v: &i32| *v < 0, |v: &mut i32| *v = -1);
        for map in maps() {
            map.upsert(5, 50);
            assert_eq!(map.delete(5, &policy), OperationResult::Updated);
            assert_eq!(map.delete(6, &policy), OperationResult::Added);
            assert_eq!(map.try_get(&5), Some(-1));
            assert_eq!(map.try_get(&6), Some(-1));
        }
    }

    #[test]
    fn test_neighbour_queries() {
        for map in maps() {
            for k in [10, 20, 30] {
                map.upsert(k, k);
            }
            assert_eq!(map.seek_ge(&15).map(|e| e.0), Some(20));
            assert_eq!(map.seek_ge(&20).map(|e| e.0), Some(20));
            assert_eq!(map.seek_le(&15).map(|e| e.0), Some(10));
            assert_eq!(map.seek_le(&5), None);
            assert_eq!(map.next_after(&20).map(|e| e.0), Some(30));
            assert_eq!(map.next_after(&30), None);
            assert_eq!(map.prev_before(&10), None);
            assert_eq!(map.prev_before(&11).map(|e| e.0), Some(10));
        }
    }

    #[test]
    fn test_iterator_forward_and_backward() {
        for map in maps() {
            for k in [3, 1, 2] {
                map.upsert(k, k * 10);
            }
            let mut it = MapIterator::new(map.clone());
            let mut forward = vec![];
            while let Some((k, _)) = it.next_entry().unwrap() {
                forward.push(k);
            }
            assert_eq!(forward, vec![1, 2, 3]);

            it.seek_last();
            let mut backward = vec![];
            while let Some((k, _)) = it.prev_entry().unwrap() {
                backward.push(k);
            }
            assert_eq!(backward, vec![3, 2, 1]);

            it.seek_le(&2).unwrap();
            assert_eq!(it.prev_entry().unwrap(), Some((2, 20)));
            it.seek_ge(&2).unwrap();
            assert_eq!(it.next_entry().unwrap(), Some((2, 20)));
            assert_eq!(it.next_entry().unwrap(), Some((3, 30)));
        }
    }

    #[test]
    fn test_iterator_observes_live_inserts() {
        let map = maps().remove(0);
        map.upsert(1, 1);
        map.upsert(5, 5);
        let mut it = MapIterator::new(map.clone());
        assert_eq!(it.next_entry().unwrap().map(|e| e.0), Some(1));
        map.upsert(3, 3);
        assert_eq!(it.next_entry().unwrap().map(|e| e.0), Some(3));
        assert_eq!(it.next_entry().unwrap().map(|e| e.0), Some(5));
        assert_eq!(it.next_entry().unwrap(), None);
    }
}
