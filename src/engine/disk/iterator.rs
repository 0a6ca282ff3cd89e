//! STRATA - Disk Segment Iterator
//! Position cursor over a pinned disk segment.

use super::{DiskSegment, DiskSegmentReader};
use crate::engine::seekable::SeekableIterator;
use crate::error::Result;
use crate::types::Record;

use std::sync::Arc;

/// Seekable cursor that holds a reader registration for its lifetime,
/// so the segment's storage outlives the iteration.
pub struct DiskSegmentIterator<K: Record, V: Record> {
    segment: DiskSegmentReader<K, V>,
    /// `-1` is before the first entry, `len` past the last.
    position: i64,
}

impl<K: Record, V: Record> DiskSegmentIterator<K, V> {
    pub fn new(segment: Arc<DiskSegment<K, V>>) -> Self {
        Self::pinned(DiskSegmentReader::new(segment))
    }

    /// Iterate under an existing reader registration.
    pub fn pinned(segment: DiskSegmentReader<K, V>) -> Self {
        Self {
            segment,
            position: 0,
        }
    }

    pub fn segment(&self) -> &Arc<DiskSegment<K, V>> {
        self.segment.segment()
    }

    /// Index of the entry the next `next_entry` returns.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn set_position(&mut self, position: i64) {
        self.position = position.clamp(-1, self.segment.len() as i64);
    }

    fn current(&self) -> Result<Option<(K, V)>> {
        if self.position < 0 || self.position >= self.segment.len() as i64 {
            return Ok(None);
        }
        self.segment.read_entry(self.position as usize).map(Some)
    }
}

impl<K: Record, V: Record> SeekableIterator<K, V> for DiskSegmentIterator<K, V> {
    fn seek_first(&mut self) {
        self.position = 0;
    }

    fn seek_last(&mut self) {
        self.position = self.segment.len() as i64 - 1;
    }

    fn seek_ge(&mut self, key: &K) -> Result<()> {
        self.position = self.segment.first_greater_or_equal_position(key)? as i64;
        Ok(())
    }

    fn seek_le(&mut self, key: &K) -> Result<()> {
        self.position = match self.segment.last_smaller_or_equal_position(key)? {
            Some(p) => p as i64,
            None => -1,
        };
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<(K, V)>> {
        let entry = self.current()?;
        if entry.is_some() {
            self.position += 1;
        }
        Ok(entry)
    }

    fn prev_entry(&mut self) -> Result<Option<(K, V)>> {
        let entry = self.current()?;
        if entry.is_some() {
            self.position -= 1;
        }
        Ok(entry)
    }
}
