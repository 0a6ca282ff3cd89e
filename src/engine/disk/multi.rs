//! STRATA - Multi-Part Disk Segment
//! A disk segment made of independently stored parts.
//!
//! The segment keeps `2 × part_count` boundary keys and values in memory:
//! the first and last entry of every part. A key is routed to its part by
//! binary search over that array, then the part runs its own search. Keys
//! equal to a boundary are answered without touching storage.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use super::meta::{self, DiskSegmentMeta};
use super::single::SinglePartSegment;
use crate::device::DeviceCategory;
use crate::error::{Result, StrataError};
use crate::options::EngineOptions;
use crate::types::{Record, SegmentId};

/// First and last entry of a part.
#[derive(Debug, Clone)]
pub struct PartBoundary<K, V> {
    pub first_key: K,
    pub last_key: K,
    pub first_value: V,
    pub last_value: V,
}

pub struct MultiPartSegment<K, V> {
    id: SegmentId,
    parts: Vec<Arc<SinglePartSegment<K, V>>>,
    /// `[first_0, last_0, first_1, last_1, ...]`
    boundary_keys: Vec<K>,
    boundary_values: Vec<V>,
    /// `offsets[i]` is the global index of the first entry of part `i`;
    /// `offsets[parts.len()]` is the total length.
    offsets: Vec<usize>,
    options: Arc<EngineOptions<K, V>>,
}

impl<K: Record, V: Record> MultiPartSegment<K, V> {
    /// Assemble a segment from sealed, non-empty parts and their boundaries.
    pub(crate) fn new(
        id: SegmentId,
        parts: Vec<Arc<SinglePartSegment<K, V>>>,
        boundaries: Vec<PartBoundary<K, V>>,
        options: Arc<EngineOptions<K, V>>,
    ) -> Result<Self> {
        if parts.len() != boundaries.len() {
            return Err(StrataError::Corruption(format!(
                "segment {} has {} parts but {} boundaries",
                id,
                parts.len(),
                boundaries.len()
            )));
        }
        let mut boundary_keys = Vec::with_capacity(parts.len() * 2);
        let mut boundary_values = Vec::with_capacity(parts.len() * 2);
        for b in boundaries {
            boundary_keys.push(b.first_key);
            boundary_keys.push(b.last_key);
            boundary_values.push(b.first_value);
            boundary_values.push(b.last_value);
        }
        let mut offsets = Vec::with_capacity(parts.len() + 1);
        let mut total = 0;
        for part in &parts {
            offsets.push(total);
            total += part.len();
        }
        offsets.push(total);

        Ok(Self {
            id,
            parts,
            boundary_keys,
            boundary_values,
            offsets,
            options,
        })
    }

    /// Reopen a segment and all of its parts.
    pub fn open(id: SegmentId, options: Arc<EngineOptions<K, V>>) -> Result<Self> {
        let part_ids = match meta::read(&options.device_manager, id)? {
            DiskSegmentMeta::Multi { parts } => parts,
            DiskSegmentMeta::Single { .. } => {
                return Err(StrataError::Corruption(format!(
                    "segment {} is single-part, expected multi-part",
                    id
                )))
            }
        };
        let mut parts = Vec::with_capacity(part_ids.len());
        let mut boundaries = Vec::with_capacity(part_ids.len());
        for part_id in part_ids {
            let part = Arc::new(SinglePartSegment::open(part_id, options.clone())?);
            boundaries.push(read_boundary(&part)?);
            parts.push(part);
        }
        Self::new(id, parts, boundaries, options)
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.offsets[self.parts.len()]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_tombstones(&self) -> bool {
        self.parts.iter().any(|p| p.has_tombstones())
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn part(&self, index: usize) -> &Arc<SinglePartSegment<K, V>> {
        &self.parts[index]
    }

    pub fn parts(&self) -> &[Arc<SinglePartSegment<K, V>>] {
        &self.parts
    }

    pub fn part_ids(&self) -> Vec<SegmentId> {
        self.parts.iter().map(|p| p.id()).collect()
    }

    /// Global index of the first entry of part `index`.
    pub fn part_start(&self, index: usize) -> usize {
        self.offsets[index]
    }

    pub fn part_boundary(&self, index: usize) -> PartBoundary<K, V> {
        PartBoundary {
            first_key: self.boundary_keys[2 * index].clone(),
            last_key: self.boundary_keys[2 * index + 1].clone(),
            first_value: self.boundary_values[2 * index].clone(),
            last_value: self.boundary_values[2 * index + 1].clone(),
        }
    }

    /// Part holding global `position` and the position inside that part.
    pub fn locate(&self, position: usize) -> Result<(usize, usize)> {
        if position >= self.len() {
            return Err(StrataError::Corruption(format!(
                "index {} out of range for segment {} of length {}",
                position,
                self.id,
                self.len()
            )));
        }
        let part = self.offsets.partition_point(|&o| o <= position) - 1;
        Ok((part, position - self.offsets[part]))
    }

    /// True if `position` is the first entry of some part.
    pub fn is_beginning_of_a_part(&self, position: usize) -> bool {
        position < self.len() && self.offsets.binary_search(&position).is_ok()
    }

    fn compare(&self, a: &K, b: &K) -> Ordering {
        self.options.comparer.compare(a, b)
    }

    /// Number of boundary keys strictly smaller than `key`, or the index of
    /// an equal boundary.
    fn search_boundaries(&self, key: &K) -> std::result::Result<usize, usize> {
        self.boundary_keys
            .binary_search_by(|probe| self.compare(probe, key))
    }

    /// Global index of boundary slot `slot`.
    fn boundary_position(&self, slot: usize) -> usize {
        let part = slot / 2;
        if slot % 2 == 0 {
            self.offsets[part]
        } else {
            self.offsets[part + 1] - 1
        }
    }

    pub fn get_key(&self, position: usize) -> Result<K> {
        let (part, offset) = self.locate(position)?;
        self.parts[part].get_key(offset)
    }

    pub fn get_value(&self, position: usize) -> Result<V> {
        let (part, offset) = self.locate(position)?;
        self.parts[part].get_value(offset)
    }

    pub fn read_entry(&self, position: usize) -> Result<(K, V)> {
        let (part, offset) = self.locate(position)?;
        self.parts[part].read_entry(offset)
    }

    pub fn first_greater_or_equal_position(&self, key: &K) -> Result<usize> {
        match self.search_boundaries(key) {
            Ok(slot) => Ok(self.boundary_position(slot)),
            // Between parts (or past the end): the next part's first entry.
            Err(slot) if slot % 2 == 0 => Ok(self.offsets[slot / 2]),
            // Strictly inside part slot / 2.
            Err(slot) => {
                let part = slot / 2;
                let local = self.parts[part].first_greater_or_equal_position(key)?;
                Ok(self.offsets[part] + local)
            }
        }
    }

    pub fn last_smaller_or_equal_position(&self, key: &K) -> Result<Option<usize>> {
        match self.search_boundaries(key) {
            Ok(slot) => Ok(Some(self.boundary_position(slot))),
            Err(0) => Ok(None),
            // After the last entry of part slot / 2 - 1.
            Err(slot) if slot % 2 == 0 => Ok(Some(self.offsets[slot / 2] - 1)),
            Err(slot) => {
                let part = slot / 2;
                let local = self.parts[part].last_smaller_or_equal_position(key)?;
                Ok(local.map(|l| self.offsets[part] + l))
            }
        }
    }

    pub fn try_get(&self, key: &K) -> Result<Option<V>> {
        match self.search_boundaries(key) {
            Ok(slot) => Ok(Some(self.boundary_values[slot].clone())),
            Err(slot) if slot % 2 == 0 => Ok(None),
            Err(slot) => self.parts[slot / 2].try_get(key),
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        match self.search_boundaries(key) {
            Ok(_) => Ok(true),
            Err(slot) if slot % 2 == 0 => Ok(false),
            Err(slot) => self.parts[slot / 2].contains_key(key),
        }
    }

    /// Delete every part not listed in `exclusions`, then the segment's own
    /// metadata. Each part is attempted even if an earlier one fails; the
    /// first error is returned.
    pub fn drop_storage(&self, exclusions: &HashSet<SegmentId>) -> Result<()> {
        let mut first_error = None;
        for part in &self.parts {
            if exclusions.contains(&part.id()) {
                continue;
            }
            if let Err(err) = part.drop_storage() {
                log::warn!("Failed to drop part {} of segment {}: {}", part.id(), self.id, err);
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self
            .options
            .device_manager
            .delete(self.id, DeviceCategory::DiskMeta)
        {
            first_error.get_or_insert(err);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Read the first and last entry of a non-empty part.
pub fn read_boundary<K: Record, V: Record>(
    part: &SinglePartSegment<K, V>,
) -> Result<PartBoundary<K, V>> {
    if part.is_empty() {
        return Err(StrataError::Corruption(format!(
            "part {} is empty",
            part.id()
        )));
    }
    let (first_key, first_value) = part.read_entry(0)?;
    let (last_key, last_value) = part.read_entry(part.len() - 1)?;
    Ok(PartBoundary {
        first_key,
        last_key,
        first_value,
        last_value,
    })
}
