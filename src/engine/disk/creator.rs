//! STRATA - Disk Segment Creators
//! Sequential, append-only builders consumed once by a merge.
//!
//! Entries must arrive in comparer order; the merge guarantees it. The
//! multi-part creator cuts the stream into parts of a randomized length
//! within `[minimum_record_count, maximum_record_count]`, so part
//! boundaries do not line up across successive merges, and it can splice
//! an existing part into the output unchanged.

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::meta::{self, DiskSegmentMeta};
use super::multi::{MultiPartSegment, PartBoundary};
use super::single::{EntryHeader, Layout, SinglePartSegment};
use super::DiskSegment;
use crate::device::{DeviceCategory, SharedDevice};
use crate::error::{Result, StrataError};
use crate::options::EngineOptions;
use crate::types::{DiskSegmentMode, Record, SegmentId, SegmentIdGenerator};

pub struct SinglePartCreator<K, V> {
    id: SegmentId,
    options: Arc<EngineOptions<K, V>>,
    layout: Layout,
    header: Option<SharedDevice>,
    data: SharedDevice,
    length: usize,
    has_tombstones: bool,
    first: Option<(K, V)>,
    last: Option<(K, V)>,
}

impl<K: Record, V: Record> SinglePartCreator<K, V> {
    pub fn new(id: SegmentId, options: Arc<EngineOptions<K, V>>) -> Result<Self> {
        let layout = Layout::for_options(&options);
        let manager = &options.device_manager;
        let data = manager.create(id, DeviceCategory::DiskData, false)?;
        let header = match layout {
            Layout::Variable => Some(manager.create(id, DeviceCategory::DiskHeader, false)?),
            Layout::Fixed { .. } => None,
        };
        Ok(Self {
            id,
            options,
            layout,
            header,
            data,
            length: 0,
            has_tombstones: false,
            first: None,
            last: None,
        })
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

    pub fn append(&mut self, key: &K, value: &V) -> Result<()> {
        let key_bytes = self.options.key_serializer.serialize(key)?;
        let value_bytes = self.options.value_serializer.serialize(value)?;

        let mut entry = Vec::with_capacity(key_bytes.len() + value_bytes.len());
        entry.extend_from_slice(&key_bytes);
        entry.extend_from_slice(&value_bytes);

        match self.layout {
            Layout::Fixed {
                key_size,
                value_size,
            } => {
                if key_bytes.len() != key_size || value_bytes.len() != value_size {
                    return Err(StrataError::Serialization(format!(
                        "fixed-size serializer produced {}+{} bytes, declared {}+{}",
                        key_bytes.len(),
                        value_bytes.len(),
                        key_size,
                        value_size
                    )));
                }
                self.data.append(&entry)?;
            }
            Layout::Variable => {
                let key_offset = self.data.append(&entry)?;
                let header = EntryHeader {
                    key_offset,
                    key_len: key_bytes.len() as u32,
                    value_len: value_bytes.len() as u32,
                };
                if let Some(device) = &self.header {
                    device.append(&header.encode())?;
                }
            }
        }

        if self.options.deletion.is_deleted(value) {
            self.has_tombstones = true;
        }
        if self.first.is_none() {
            self.first = Some((key.clone(), value.clone()));
        }
        self.last = Some((key.clone(), value.clone()));
        self.length += 1;
        Ok(())
    }

    /// Seal the devices, persist metadata and open the finished part.
    pub fn seal(self) -> Result<SinglePartSegment<K, V>> {
        self.seal_with_boundary().map(|(segment, _)| segment)
    }

    pub(crate) fn seal_with_boundary(
        self,
    ) -> Result<(SinglePartSegment<K, V>, Option<PartBoundary<K, V>>)> {
        self.data.seal()?;
        if let Some(header) = &self.header {
            header.seal()?;
        }
        meta::write(
            &self.options.device_manager,
            self.id,
            &DiskSegmentMeta::Single {
                length: self.length as u64,
                has_tombstones: self.has_tombstones,
                fixed: self.layout.to_meta(),
            },
        )?;
        let boundary = match (self.first, self.last) {
            (Some((first_key, first_value)), Some((last_key, last_value))) => Some(PartBoundary {
                first_key,
                last_key,
                first_value,
                last_value,
            }),
            _ => None,
        };
        let segment = SinglePartSegment::new(
            self.id,
            self.length,
            self.has_tombstones,
            self.layout,
            self.header,
            self.data,
            self.options,
        )?;
        Ok((segment, boundary))
    }

    /// Delete everything written so far.
    pub fn discard(self) -> Result<()> {
        let manager = &self.options.device_manager;
        manager.delete(self.id, DeviceCategory::DiskData)?;
        manager.delete(self.id, DeviceCategory::DiskHeader)?;
        manager.delete(self.id, DeviceCategory::DiskMeta)?;
        Ok(())
    }
}

pub struct MultiPartCreator<K, V> {
    id: SegmentId,
    options: Arc<EngineOptions<K, V>>,
    ids: Arc<SegmentIdGenerator>,
    minimum_record_count: usize,
    maximum_record_count: usize,
    parts: Vec<Arc<SinglePartSegment<K, V>>>,
    boundaries: Vec<PartBoundary<K, V>>,
    created_parts: Vec<SegmentId>,
    reused_parts: HashSet<SegmentId>,
    current: Option<SinglePartCreator<K, V>>,
    current_target: usize,
    length: usize,
    rng: StdRng,
}

impl<K: Record, V: Record> MultiPartCreator<K, V> {
    pub fn new(
        id: SegmentId,
        options: Arc<EngineOptions<K, V>>,
        ids: Arc<SegmentIdGenerator>,
        minimum_record_count: usize,
        maximum_record_count: usize,
    ) -> Result<Self> {
        if minimum_record_count == 0 || minimum_record_count > maximum_record_count {
            return Err(StrataError::Config(format!(
                "invalid part bounds {}..={}",
                minimum_record_count, maximum_record_count
            )));
        }
        Ok(Self {
            id,
            options,
            ids,
            minimum_record_count,
            maximum_record_count,
            parts: Vec::new(),
            boundaries: Vec::new(),
            created_parts: Vec::new(),
            reused_parts: HashSet::new(),
            current: None,
            current_target: 0,
            length: 0,
            rng: StdRng::from_entropy(),
        })
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

    pub fn part_count(&self) -> usize {
        self.parts.len() + usize::from(self.current.as_ref().map_or(false, |c| !c.is_empty()))
    }

    /// Parts spliced in unchanged through [`append_part`](Self::append_part).
    #[cfg(test)]
    pub(crate) fn reused_parts(&self) -> &HashSet<SegmentId> {
        &self.reused_parts
    }

    fn start_part(&mut self) -> Result<()> {
        let part_id = self.ids.next_id();
        self.current = Some(SinglePartCreator::new(part_id, self.options.clone())?);
        self.created_parts.push(part_id);
        self.current_target = self
            .rng
            .gen_range(self.minimum_record_count..=self.maximum_record_count);
        Ok(())
    }

    fn close_current_part(&mut self) -> Result<()> {
        let Some(creator) = self.current.take() else {
            return Ok(());
        };
        if creator.is_empty() {
            let id = creator.id();
            self.created_parts.retain(|&p| p != id);
            return creator.discard();
        }
        let (part, boundary) = creator.seal_with_boundary()?;
        let boundary = boundary.ok_or_else(|| {
            StrataError::Corruption(format!("sealed part {} has no boundary", part.id()))
        })?;
        self.parts.push(Arc::new(part));
        self.boundaries.push(boundary);
        Ok(())
    }

    pub fn append(&mut self, key: &K, value: &V) -> Result<()> {
        if self.current.is_none() {
            self.start_part()?;
        }
        let reached_target = match self.current.as_mut() {
            Some(current) => {
                current.append(key, value)?;
                current.len() >= self.current_target
            }
            None => false,
        };
        self.length += 1;
        if reached_target {
            self.close_current_part()?;
        }
        Ok(())
    }

    /// True if the part being written may be closed now without leaving a
    /// part shorter than the minimum record count.
    pub fn can_skip_current_part(&self) -> bool {
        self.current
            .as_ref()
            .map_or(true, |c| c.is_empty() || c.len() >= self.minimum_record_count)
    }

    /// Splice an existing part into the output without rewriting it.
    pub fn append_part(
        &mut self,
        part: Arc<SinglePartSegment<K, V>>,
        boundary: PartBoundary<K, V>,
    ) -> Result<()> {
        self.close_current_part()?;
        self.length += part.len();
        self.reused_parts.insert(part.id());
        self.parts.push(part);
        self.boundaries.push(boundary);
        Ok(())
    }

    pub fn seal(mut self) -> Result<MultiPartSegment<K, V>> {
        self.close_current_part()?;
        let part_ids = self.parts.iter().map(|p| p.id()).collect();
        meta::write(
            &self.options.device_manager,
            self.id,
            &DiskSegmentMeta::Multi { parts: part_ids },
        )?;
        log::debug!(
            "Multi-part segment {} sealed: {} parts, {} reused",
            self.id,
            self.parts.len(),
            self.reused_parts.len()
        );
        MultiPartSegment::new(self.id, self.parts, self.boundaries, self.options)
    }

    /// Delete every part this creator wrote. Reused parts are left alone.
    pub fn discard(mut self) -> Result<()> {
        if let Some(current) = self.current.take() {
            current.discard()?;
        }
        let manager = &self.options.device_manager;
        for id in &self.created_parts {
            manager.delete(*id, DeviceCategory::DiskData)?;
            manager.delete(*id, DeviceCategory::DiskHeader)?;
            manager.delete(*id, DeviceCategory::DiskMeta)?;
        }
        manager.delete(self.id, DeviceCategory::DiskMeta)?;
        Ok(())
    }
}

/// The output of one merge, in either disk segment mode.
pub enum SegmentCreator<K, V> {
    Single(SinglePartCreator<K, V>),
    Multi(MultiPartCreator<K, V>),
}

impl<K: Record, V: Record> SegmentCreator<K, V> {
    pub fn new(
        mode: DiskSegmentMode,
        id: SegmentId,
        options: Arc<EngineOptions<K, V>>,
        ids: Arc<SegmentIdGenerator>,
    ) -> Result<Self> {
        Ok(match mode {
            DiskSegmentMode::SingleDiskSegment => {
                SegmentCreator::Single(SinglePartCreator::new(id, options)?)
            }
            DiskSegmentMode::MultiPartDiskSegment => {
                let (min, max) = (
                    options.config.minimum_record_count,
                    options.config.maximum_record_count,
                );
                SegmentCreator::Multi(MultiPartCreator::new(id, options, ids, min, max)?)
            }
        })
    }

    pub fn id(&self) -> SegmentId {
        match self {
            SegmentCreator::Single(c) => c.id(),
            SegmentCreator::Multi(c) => c.id(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SegmentCreator::Single(c) => c.len(),
            SegmentCreator::Multi(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, key: &K, value: &V) -> Result<()> {
        match self {
            SegmentCreator::Single(c) => c.append(key, value),
            SegmentCreator::Multi(c) => c.append(key, value),
        }
    }

    pub fn can_skip_current_part(&self) -> bool {
        match self {
            SegmentCreator::Single(_) => false,
            SegmentCreator::Multi(c) => c.can_skip_current_part(),
        }
    }

    pub fn append_part(
        &mut self,
        part: Arc<SinglePartSegment<K, V>>,
        boundary: PartBoundary<K, V>,
    ) -> Result<()> {
        match self {
            SegmentCreator::Single(_) => Err(StrataError::Config(
                "single-part creator cannot splice parts".into(),
            )),
            SegmentCreator::Multi(c) => c.append_part(part, boundary),
        }
    }

    pub fn seal(self) -> Result<DiskSegment<K, V>> {
        match self {
            SegmentCreator::Single(c) => Ok(DiskSegment::from_single(c.seal()?)),
            SegmentCreator::Multi(c) => Ok(DiskSegment::from_multi(c.seal()?)),
        }
    }

    pub fn discard(self) -> Result<()> {
        match self {
            SegmentCreator::Single(c) => c.discard(),
            SegmentCreator::Multi(c) => c.discard(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::fixed_options;
    use super::*;

    #[test]
    fn test_part_sizes_within_bounds() {
        let options = fixed_options(4);
        let ids = Arc::new(SegmentIdGenerator::new(10));
        let mut creator = MultiPartCreator::new(1, options, ids, 33, 77).unwrap();
        for k in 0..1000u64 {
            creator.append(&k, &1).unwrap();
        }
        let segment = creator.seal().unwrap();
        assert_eq!(segment.len(), 1000);
        let parts = segment.parts();
        for part in &parts[..parts.len() - 1] {
            assert!((33..=77).contains(&part.len()), "part of {}", part.len());
        }
    }

    #[test]
    fn test_append_part_reuses_storage() {
        let options = fixed_options(4);
        let ids = Arc::new(SegmentIdGenerator::new(10));
        let mut first = MultiPartCreator::new(1, options.clone(), ids.clone(), 5, 5).unwrap();
        for k in 0..10u64 {
            first.append(&k, &(k as i64)).unwrap();
        }
        let original = first.seal().unwrap();

        let mut second = MultiPartCreator::new(2, options.clone(), ids, 5, 5).unwrap();
        assert!(second.can_skip_current_part());
        second
            .append_part(original.part(0).clone(), original.part_boundary(0))
            .unwrap();
        second.append(&100, &100).unwrap();
        assert!(!second.can_skip_current_part());
        assert!(second.reused_parts().contains(&original.part(0).id()));
        let merged = second.seal().unwrap();

        assert_eq!(merged.part(0).id(), original.part(0).id());
        assert_eq!(merged.len(), 6);
        assert_eq!(merged.try_get(&4).unwrap(), Some(4));
        assert_eq!(merged.try_get(&100).unwrap(), Some(100));
    }

    #[test]
    fn test_discard_keeps_reused_parts() {
        let options = fixed_options(4);
        let ids = Arc::new(SegmentIdGenerator::new(10));
        let mut first = MultiPartCreator::new(1, options.clone(), ids.clone(), 3, 3).unwrap();
        for k in 0..3u64 {
            first.append(&k, &0).unwrap();
        }
        let original = first.seal().unwrap();
        let reused = original.part(0).id();

        let mut second = MultiPartCreator::new(2, options.clone(), ids, 3, 3).unwrap();
        second
            .append_part(original.part(0).clone(), original.part_boundary(0))
            .unwrap();
        for k in 10..14u64 {
            second.append(&k, &0).unwrap();
        }
        second.discard().unwrap();

        let manager = &options.device_manager;
        assert!(manager.exists(reused, DeviceCategory::DiskData));
        let remaining = manager.segment_ids().unwrap();
        // Original meta (1) and the reused part only.
        assert_eq!(remaining, vec![1, reused]);
    }

    #[test]
    fn test_fixed_size_mismatch_rejected() {
        let mut options = (*fixed_options(4)).clone();
        options.key_serializer = Arc::new(crate::serializer::BincodeSerializer::fixed(4));
        let mut creator = SinglePartCreator::<u64, i64>::new(1, Arc::new(options)).unwrap();
        assert!(matches!(
            creator.append(&1, &1),
            Err(StrataError::Serialization(_))
        ));
    }
}
