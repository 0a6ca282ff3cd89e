//! STRATA - Seekable Segment Iterators
//! The cursor contract shared by every segment-level iterator.

use crate::error::Result;

/// Bidirectional cursor over one sorted segment.
///
/// `next_entry` returns the entry under the cursor and moves forward;
/// `prev_entry` returns it and moves backward. The seek methods place the
/// cursor so that the following `next_entry` (for `seek_ge`/`seek_first`)
/// or `prev_entry` (for `seek_le`/`seek_last`) yields the target.
pub trait SeekableIterator<K, V>: Send {
    fn seek_first(&mut self);

    fn seek_last(&mut self);

    /// Positions at the first key greater than or equal to `key`.
    fn seek_ge(&mut self, key: &K) -> Result<()>;

    /// Positions at the last key smaller than or equal to `key`.
    fn seek_le(&mut self, key: &K) -> Result<()>;

    fn next_entry(&mut self) -> Result<Option<(K, V)>>;

    fn prev_entry(&mut self) -> Result<Option<(K, V)>>;
}
