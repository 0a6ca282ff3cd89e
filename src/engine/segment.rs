//! STRATA - Mutable Segment ("segment zero")
//! The current write target of the engine. Wraps an ordered map and a WAL,
//! and freezes one-way into a read-only segment.
//!
//! ## Freeze protocol
//! Writers register in `writers` before checking the `frozen` flag. A
//! freeze flips the flag; writers that already passed the check finish
//! their write, later ones get [`OperationResult::RetrySegmentIsFrozen`].
//! The segment is *fully* frozen once the flag is set and no writer is in
//! flight, at which point the map is frozen and the WAL sealed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::map::{MapIterator, SharedOrderedMap};
use super::wal::{WalRecord, WriteAheadLog};
use crate::error::Result;
use crate::options::EngineOptions;
use crate::types::{OpIndex, OperationResult, Record, SegmentId};

/// A frozen mutable segment waiting in the read-only queue.
pub type ReadOnlySegment<K, V> = MutableSegment<K, V>;

/// Decrements the in-flight writer count when a write leaves the segment.
struct WriterGuard<'a>(&'a AtomicUsize);

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MutableSegment<K, V> {
    id: SegmentId,
    map: SharedOrderedMap<K, V>,
    wal: WriteAheadLog,
    options: Arc<EngineOptions<K, V>>,
    max_item_count: usize,
    writers: AtomicUsize,
    frozen: AtomicBool,
    freeze_completed: AtomicBool,
    /// Serializes op index assignment, WAL append and map update so writes
    /// to one key land in op index order.
    write_lock: Mutex<()>,
    complete_lock: Mutex<()>,
}

impl<K: Record, V: Record + Default> MutableSegment<K, V> {
    /// Create an empty segment with a fresh WAL.
    pub fn create(id: SegmentId, options: Arc<EngineOptions<K, V>>) -> Result<Self> {
        let wal = WriteAheadLog::create(&options.device_manager, id, options.config.sync_writes)?;
        Ok(Self::with_wal(id, wal, options))
    }

    /// Rebuild a segment by replaying its WAL.
    /// Returns the segment and the highest op index found in the log.
    pub fn recover(id: SegmentId, options: Arc<EngineOptions<K, V>>) -> Result<(Self, OpIndex)> {
        let wal = WriteAheadLog::open(&options.device_manager, id, options.config.sync_writes)?;
        let records = wal.replay()?;
        let segment = Self::with_wal(id, wal, options);

        let mut max_op_index = 0;
        for record in records {
            max_op_index = max_op_index.max(record.op_index());
            match record {
                WalRecord::Upsert { key, value, .. } => {
                    let key = segment.options.key_serializer.deserialize(&key)?;
                    let value = segment.options.value_serializer.deserialize(&value)?;
                    segment.map.upsert(key, value);
                }
                WalRecord::Delete { key, .. } => {
                    let key = segment.options.key_serializer.deserialize(&key)?;
                    segment.map.delete(key, segment.options.deletion.as_ref());
                }
            }
        }
        log::debug!(
            "Recovered segment {} with {} entries (max op index {})",
            id,
            segment.len(),
            max_op_index
        );
        Ok((segment, max_op_index))
    }

    fn with_wal(id: SegmentId, wal: WriteAheadLog, options: Arc<EngineOptions<K, V>>) -> Self {
        let map = options.map_factory.create(options.comparer.clone());
        Self {
            id,
            map,
            wal,
            max_item_count: options.config.mutable_segment_max_item_count,
            options,
            writers: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            freeze_completed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            complete_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn enter(&self) -> (WriterGuard<'_>, Option<OperationResult>) {
        self.writers.fetch_add(1, Ordering::SeqCst);
        let guard = WriterGuard(&self.writers);
        if self.frozen.load(Ordering::SeqCst) {
            return (guard, Some(OperationResult::RetrySegmentIsFrozen));
        }
        if self.map.len() >= self.max_item_count {
            return (guard, Some(OperationResult::RetrySegmentIsFull));
        }
        (guard, None)
    }

    /// Insert or replace a value. On success returns the op index assigned
    /// to the write.
    pub fn upsert(
        &self,
        key: K,
        value: V,
        op_counter: &AtomicU64,
    ) -> Result<(OperationResult, Option<OpIndex>)> {
        let (_guard, rejected) = self.enter();
        if let Some(result) = rejected {
            return Ok((result, None));
        }
        let key_bytes = self.options.key_serializer.serialize(&key)?;
        let value_bytes = self.options.value_serializer.serialize(&value)?;

        let _write = self.write_lock.lock();
        let op_index = op_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.wal.append_upsert(op_index, &key_bytes, &value_bytes)?;
        let result = self.map.upsert(key, value);
        Ok((result, result.is_success().then_some(op_index)))
    }

    /// Write a tombstone for `key`.
    pub fn delete(&self, key: K, op_counter: &AtomicU64) -> Result<(OperationResult, Option<OpIndex>)> {
        let (_guard, rejected) = self.enter();
        if let Some(result) = rejected {
            return Ok((result, None));
        }
        let key_bytes = self.options.key_serializer.serialize(&key)?;

        let _write = self.write_lock.lock();
        let op_index = op_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.wal.append_delete(op_index, &key_bytes)?;
        let result = self.map.delete(key, self.options.deletion.as_ref());
        Ok((result, result.is_success().then_some(op_index)))
    }

    /// Raw lookup: tombstones are returned as stored.
    pub fn try_get(&self, key: &K) -> Option<V> {
        self.map.try_get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Stop accepting writes. Returns false if the segment was already frozen.
    pub fn freeze(&self) -> bool {
        let changed = !self.frozen.swap(true, Ordering::SeqCst);
        if changed {
            log::debug!("Segment {} frozen with {} entries", self.id, self.len());
        }
        changed
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// True once frozen with no write still in flight.
    pub fn is_fully_frozen(&self) -> bool {
        self.is_frozen() && self.writers.load(Ordering::SeqCst) == 0
    }

    /// Seal the map and WAL if the segment became fully frozen.
    fn complete_freeze(&self) -> Result<()> {
        let _lock = self.complete_lock.lock();
        if self.freeze_completed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.map.freeze();
        self.wal.seal()?;
        self.freeze_completed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Spin until in-flight writers drain or `timeout` passes.
    /// Returns whether the segment is fully frozen.
    pub fn wait_fully_frozen(&self, timeout: Duration) -> Result<bool> {
        if !self.is_frozen() {
            return Ok(false);
        }
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        while !self.is_fully_frozen() {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if spins < 64 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
        self.complete_freeze()?;
        Ok(true)
    }

    /// Live seekable iterator over the segment's map.
    pub fn iter(&self) -> MapIterator<K, V> {
        MapIterator::new(self.map.clone())
    }

    /// Delete the segment's WAL. Called once its entries live in a disk segment.
    pub fn drop_storage(&self) -> Result<()> {
        WriteAheadLog::delete(&self.options.device_manager, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::MemoryDeviceManager;
    use crate::engine::seekable::SeekableIterator;
    use crate::options::FnDeletionPolicy;

    fn options(max_items: usize) -> Arc<EngineOptions<u64, i64>> {
        let config = Config::new("unused").with_mutable_segment_max_item_count(max_items);
        let deletion = Arc::new(FnDeletionPolicy::new(
            |v: &i64| *v == -1,
            |v: &mut i64| *v = -1,
        ));
        let options = EngineOptions {
            config,
            comparer: Arc::new(crate::comparer::NaturalComparer),
            key_serializer: Arc::new(crate::serializer::BincodeSerializer::fixed(8)),
            value_serializer: Arc::new(crate::serializer::BincodeSerializer::fixed(8)),
            deletion,
            device_manager: Arc::new(MemoryDeviceManager::new()),
            map_factory: Arc::new(crate::engine::map::BTreeMapFactory),
        };
        Arc::new(options)
    }

    #[test]
    fn test_upsert_assigns_increasing_op_index() {
        let segment = MutableSegment::create(1, options(10)).unwrap();
        let counter = AtomicU64::new(0);
        let (r1, i1) = segment.upsert(1, 10, &counter).unwrap();
        let (r2, i2) = segment.upsert(1, 11, &counter).unwrap();
        assert_eq!(r1, OperationResult::Added);
        assert_eq!(r2, OperationResult::Updated);
        assert!(i1.unwrap() < i2.unwrap());
        assert_eq!(segment.try_get(&1), Some(11));
    }

    #[test]
    fn test_full_segment_requests_retry() {
        let segment = MutableSegment::create(1, options(2)).unwrap();
        let counter = AtomicU64::new(0);
        segment.upsert(1, 1, &counter).unwrap();
        segment.upsert(2, 2, &counter).unwrap();
        let (result, index) = segment.upsert(3, 3, &counter).unwrap();
        assert_eq!(result, OperationResult::RetrySegmentIsFull);
        assert_eq!(index, None);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_freeze_is_one_way() {
        let segment = MutableSegment::create(1, options(10)).unwrap();
        let counter = AtomicU64::new(0);
        segment.upsert(1, 1, &counter).unwrap();
        assert!(segment.freeze());
        assert!(!segment.freeze());
        let (result, _) = segment.delete(1, &counter).unwrap();
        assert_eq!(result, OperationResult::RetrySegmentIsFrozen);
        assert!(segment.wait_fully_frozen(Duration::from_millis(10)).unwrap());
        assert!(segment.is_fully_frozen());
    }

    #[test]
    fn test_wait_on_unfrozen_segment_returns_false() {
        let segment = MutableSegment::create(1, options(10)).unwrap();
        assert!(!segment.wait_fully_frozen(Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn test_recover_replays_wal() {
        let options = options(100);
        let counter = AtomicU64::new(0);
        {
            let segment = MutableSegment::create(7, options.clone()).unwrap();
            segment.upsert(1, 100, &counter).unwrap();
            segment.upsert(2, 200, &counter).unwrap();
            segment.delete(1, &counter).unwrap();
        }
        let (segment, max_op) = MutableSegment::recover(7, options).unwrap();
        assert_eq!(max_op, 3);
        assert_eq!(segment.try_get(&1), Some(-1));
        assert_eq!(segment.try_get(&2), Some(200));

        let mut it = segment.iter();
        assert_eq!(it.next_entry().unwrap(), Some((1, -1)));
        assert_eq!(it.next_entry().unwrap(), Some((2, 200)));
        assert_eq!(it.next_entry().unwrap(), None);
    }
}
