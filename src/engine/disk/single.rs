//! STRATA - Single-Part Disk Segment
//! Immutable, binary-searchable sorted run stored on one or two devices.
//!
//! ## Layouts
//! ```text
//! Variable: header device  [key_offset: u64][key_len: u32][val_len: u32]  (16 bytes/entry)
//!           data device    [key bytes][value bytes] ...
//! Fixed:    data device    [key: ks bytes][value: vs bytes] ...         (ks + vs bytes/entry)
//! ```
//! The fixed layout is used when both serializers report a constant width.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::{Buf, BufMut};

use super::meta::{self, DiskSegmentMeta};
use crate::device::{DeviceCategory, SharedDevice};
use crate::error::{Result, StrataError};
use crate::options::EngineOptions;
use crate::types::{Record, SegmentId};

pub(crate) const HEADER_ENTRY_SIZE: usize = 16;

/// Physical arrangement of entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Fixed { key_size: usize, value_size: usize },
    Variable,
}

impl Layout {
    /// Layout implied by the serializers of an engine.
    pub fn for_options<K, V>(options: &EngineOptions<K, V>) -> Self {
        match (
            options.key_serializer.fixed_size(),
            options.value_serializer.fixed_size(),
        ) {
            (Some(key_size), Some(value_size)) => Layout::Fixed {
                key_size,
                value_size,
            },
            _ => Layout::Variable,
        }
    }

    pub(crate) fn to_meta(self) -> Option<(u32, u32)> {
        match self {
            Layout::Fixed {
                key_size,
                value_size,
            } => Some((key_size as u32, value_size as u32)),
            Layout::Variable => None,
        }
    }

    pub(crate) fn from_meta(fixed: Option<(u32, u32)>) -> Self {
        match fixed {
            Some((k, v)) => Layout::Fixed {
                key_size: k as usize,
                value_size: v as usize,
            },
            None => Layout::Variable,
        }
    }
}

/// Location of one entry inside the data device.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader {
    pub key_offset: u64,
    pub key_len: u32,
    pub value_len: u32,
}

impl EntryHeader {
    pub fn encode(&self) -> [u8; HEADER_ENTRY_SIZE] {
        let mut buf = [0u8; HEADER_ENTRY_SIZE];
        let mut slice = &mut buf[..];
        slice.put_u64_le(self.key_offset);
        slice.put_u32_le(self.key_len);
        slice.put_u32_le(self.value_len);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Self {
        Self {
            key_offset: bytes.get_u64_le(),
            key_len: bytes.get_u32_le(),
            value_len: bytes.get_u32_le(),
        }
    }
}

/// A sampled entry used to narrow binary searches before touching storage.
#[derive(Debug, Clone)]
pub struct SparseEntry<K, V> {
    pub key: K,
    pub value: V,
    pub index: usize,
}

pub struct SinglePartSegment<K, V> {
    id: SegmentId,
    length: usize,
    has_tombstones: bool,
    layout: Layout,
    header: Option<SharedDevice>,
    data: SharedDevice,
    options: Arc<EngineOptions<K, V>>,
    sparse: Vec<SparseEntry<K, V>>,
}

impl<K: Record, V: Record> SinglePartSegment<K, V> {
    /// Assemble a segment over sealed devices and build its sparse index.
    pub(crate) fn new(
        id: SegmentId,
        length: usize,
        has_tombstones: bool,
        layout: Layout,
        header: Option<SharedDevice>,
        data: SharedDevice,
        options: Arc<EngineOptions<K, V>>,
    ) -> Result<Self> {
        let mut segment = Self {
            id,
            length,
            has_tombstones,
            layout,
            header,
            data,
            options,
            sparse: Vec::new(),
        };
        segment.init_sparse_index()?;
        Ok(segment)
    }

    /// Reopen a sealed segment from its devices.
    pub fn open(id: SegmentId, options: Arc<EngineOptions<K, V>>) -> Result<Self> {
        let manager = &options.device_manager;
        let (length, has_tombstones, fixed) = match meta::read(manager, id)? {
            DiskSegmentMeta::Single {
                length,
                has_tombstones,
                fixed,
            } => (length as usize, has_tombstones, fixed),
            DiskSegmentMeta::Multi { .. } => {
                return Err(StrataError::Corruption(format!(
                    "segment {} is multi-part, expected a single part",
                    id
                )))
            }
        };
        let layout = Layout::from_meta(fixed);
        if layout != Layout::for_options(&options) {
            return Err(StrataError::Config(format!(
                "segment {} was written with layout {:?}, serializers imply {:?}",
                id,
                layout,
                Layout::for_options(&options)
            )));
        }
        let data = manager.open(id, DeviceCategory::DiskData, false)?;
        let header = match layout {
            Layout::Variable => Some(manager.open(id, DeviceCategory::DiskHeader, false)?),
            Layout::Fixed { .. } => None,
        };
        Self::new(id, length, has_tombstones, layout, header, data, options)
    }

    fn init_sparse_index(&mut self) -> Result<()> {
        let step = self.options.config.sparse_index_step;
        if step == 0 || self.length == 0 {
            return Ok(());
        }
        let mut sparse = Vec::with_capacity(self.length / step + 2);
        let mut index = 0;
        while index < self.length {
            let (key, value) = self.read_entry(index)?;
            sparse.push(SparseEntry { key, value, index });
            index += step;
        }
        let last = self.length - 1;
        if sparse.last().map(|e| e.index) != Some(last) {
            let (key, value) = self.read_entry(last)?;
            sparse.push(SparseEntry {
                key,
                value,
                index: last,
            });
        }
        self.sparse = sparse;
        Ok(())
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn has_tombstones(&self) -> bool {
        self.has_tombstones
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn sparse_index(&self) -> &[SparseEntry<K, V>] {
        &self.sparse
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.length {
            return Err(StrataError::Corruption(format!(
                "index {} out of range for segment {} of length {}",
                index, self.id, self.length
            )));
        }
        Ok(())
    }

    fn header_at(&self, index: usize) -> Result<EntryHeader> {
        let header = self.header.as_ref().ok_or_else(|| {
            StrataError::Corruption(format!("segment {} has no header device", self.id))
        })?;
        let bytes = header.read_at((index * HEADER_ENTRY_SIZE) as u64, HEADER_ENTRY_SIZE)?;
        Ok(EntryHeader::decode(&bytes))
    }

    /// Offset and length of the key bytes and of the value bytes.
    fn locate(&self, index: usize) -> Result<((u64, usize), (u64, usize))> {
        self.check_index(index)?;
        Ok(match self.layout {
            Layout::Fixed {
                key_size,
                value_size,
            } => {
                let base = (index * (key_size + value_size)) as u64;
                ((base, key_size), (base + key_size as u64, value_size))
            }
            Layout::Variable => {
                let h = self.header_at(index)?;
                (
                    (h.key_offset, h.key_len as usize),
                    (h.key_offset + h.key_len as u64, h.value_len as usize),
                )
            }
        })
    }

    pub fn get_key(&self, index: usize) -> Result<K> {
        let ((offset, len), _) = self.locate(index)?;
        let bytes = self.data.read_at(offset, len)?;
        self.options.key_serializer.deserialize(&bytes)
    }

    pub fn get_value(&self, index: usize) -> Result<V> {
        let (_, (offset, len)) = self.locate(index)?;
        let bytes = self.data.read_at(offset, len)?;
        self.options.value_serializer.deserialize(&bytes)
    }

    /// Key and value with a single data read.
    pub fn read_entry(&self, index: usize) -> Result<(K, V)> {
        let ((key_offset, key_len), (_, value_len)) = self.locate(index)?;
        let bytes = self.data.read_at(key_offset, key_len + value_len)?;
        let key = self.options.key_serializer.deserialize(&bytes[..key_len])?;
        let value = self.options.value_serializer.deserialize(&bytes[key_len..])?;
        Ok((key, value))
    }

    fn compare(&self, a: &K, b: &K) -> Ordering {
        self.options.comparer.compare(a, b)
    }

    /// Search window `[lo, hi)` for `key` narrowed by the sparse index,
    /// or the exact index when a sample matches.
    fn narrow(&self, key: &K) -> std::result::Result<usize, (usize, usize)> {
        if self.sparse.is_empty() {
            return Err((0, self.length));
        }
        match self
            .sparse
            .binary_search_by(|entry| self.compare(&entry.key, key))
        {
            Ok(i) => Ok(self.sparse[i].index),
            Err(0) => Err((0, 0)),
            Err(i) if i == self.sparse.len() => Err((self.length, self.length)),
            // sparse[i - 1].key < key < sparse[i].key
            Err(i) => Err((self.sparse[i - 1].index + 1, self.sparse[i].index)),
        }
    }

    /// First index whose key is >= `key`; `len()` if there is none.
    pub fn first_greater_or_equal_position(&self, key: &K) -> Result<usize> {
        let (mut lo, mut hi) = match self.narrow(key) {
            Ok(index) => return Ok(index),
            Err(window) => window,
        };
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.compare(&self.get_key(mid)?, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Last index whose key is <= `key`; `None` if there is none.
    pub fn last_smaller_or_equal_position(&self, key: &K) -> Result<Option<usize>> {
        let (mut lo, mut hi) = match self.narrow(key) {
            Ok(index) => return Ok(Some(index)),
            Err(window) => window,
        };
        // First index with a key > `key`.
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.compare(&self.get_key(mid)?, key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo.checked_sub(1))
    }

    /// Raw lookup: a stored tombstone is returned as a value.
    pub fn try_get(&self, key: &K) -> Result<Option<V>> {
        if let Ok(i) = self
            .sparse
            .binary_search_by(|entry| self.compare(&entry.key, key))
        {
            return Ok(Some(self.sparse[i].value.clone()));
        }
        let index = self.first_greater_or_equal_position(key)?;
        if index >= self.length {
            return Ok(None);
        }
        let (found, value) = self.read_entry(index)?;
        if self.compare(&found, key) == Ordering::Equal {
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let index = self.first_greater_or_equal_position(key)?;
        if index >= self.length {
            return Ok(false);
        }
        Ok(self.compare(&self.get_key(index)?, key) == Ordering::Equal)
    }

    /// Delete every device of this part.
    pub fn drop_storage(&self) -> Result<()> {
        let manager = &self.options.device_manager;
        manager.delete(self.id, DeviceCategory::DiskData)?;
        manager.delete(self.id, DeviceCategory::DiskHeader)?;
        manager.delete(self.id, DeviceCategory::DiskMeta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::creator::SinglePartCreator;
    use super::super::tests_support::{fixed_options, string_options};
    use super::*;

    fn build_fixed(keys: &[u64], step: usize) -> SinglePartSegment<u64, i64> {
        let options = fixed_options(step);
        let mut creator = SinglePartCreator::new(10, options).unwrap();
        for &k in keys {
            creator.append(&k, &(k as i64 * 2)).unwrap();
        }
        creator.seal().unwrap()
    }

    #[test]
    fn test_fixed_layout_lookup() {
        let keys: Vec<u64> = (0..100).map(|k| k * 2).collect();
        let segment = build_fixed(&keys, 8);
        assert_eq!(segment.layout(), Layout::Fixed { key_size: 8, value_size: 8 });
        assert_eq!(segment.len(), 100);
        assert_eq!(segment.get_key(10).unwrap(), 20);
        assert_eq!(segment.get_value(10).unwrap(), 40);
        assert_eq!(segment.try_get(&42).unwrap(), Some(84));
        assert_eq!(segment.try_get(&43).unwrap(), None);
        assert!(segment.contains_key(&0).unwrap());
        assert!(!segment.contains_key(&199).unwrap());
    }

    #[test]
    fn test_positions_with_and_without_sparse_index() {
        let keys: Vec<u64> = (0..57).map(|k| k * 10).collect();
        for step in [0, 1, 4, 100] {
            let segment = build_fixed(&keys, step);
            assert_eq!(segment.first_greater_or_equal_position(&0).unwrap(), 0);
            assert_eq!(segment.first_greater_or_equal_position(&5).unwrap(), 1);
            assert_eq!(segment.first_greater_or_equal_position(&560).unwrap(), 56);
            assert_eq!(segment.first_greater_or_equal_position(&561).unwrap(), 57);
            assert_eq!(segment.last_smaller_or_equal_position(&5).unwrap(), Some(0));
            assert_eq!(segment.last_smaller_or_equal_position(&10).unwrap(), Some(1));
            assert_eq!(segment.last_smaller_or_equal_position(&9999).unwrap(), Some(56));
            // Sparse index has no entry below the first key.
            let below = build_fixed(&[5, 6], step);
            assert_eq!(below.last_smaller_or_equal_position(&1).unwrap(), None);
        }
    }

    #[test]
    fn test_variable_layout_round_trip_and_reopen() {
        let options = string_options(2);
        let mut creator = SinglePartCreator::new(3, options.clone()).unwrap();
        for word in ["apple", "banana", "cherry", "date"] {
            creator
                .append(&word.to_string(), &Some(word.len() as u32))
                .unwrap();
        }
        let segment = creator.seal().unwrap();
        assert_eq!(segment.layout(), Layout::Variable);
        assert_eq!(segment.read_entry(2).unwrap(), ("cherry".to_string(), Some(6)));

        let reopened = SinglePartSegment::<String, Option<u32>>::open(3, options).unwrap();
        assert_eq!(reopened.len(), 4);
        assert_eq!(reopened.try_get(&"banana".to_string()).unwrap(), Some(Some(6)));
        assert_eq!(
            reopened.first_greater_or_equal_position(&"c".to_string()).unwrap(),
            2
        );
    }

    #[test]
    fn test_out_of_range_index_is_error() {
        let segment = build_fixed(&[1, 2, 3], 2);
        assert!(segment.get_key(3).is_err());
    }

    #[test]
    fn test_header_entry_codec() {
        let h = EntryHeader {
            key_offset: 123_456,
            key_len: 7,
            value_len: 99,
        };
        let decoded = EntryHeader::decode(&h.encode());
        assert_eq!(decoded.key_offset, 123_456);
        assert_eq!(decoded.key_len, 7);
        assert_eq!(decoded.value_len, 99);
    }
}
