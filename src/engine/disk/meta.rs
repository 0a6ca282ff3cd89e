//! STRATA - Disk Segment Metadata
//! A small CRC-framed record describing a sealed disk segment, so it can
//! be reopened without scanning its data.
//!
//! ```text
//! [len: u32 (LE)][bincode(DiskSegmentMeta)][crc32: u32 (LE)]
//! ```

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceCategory, SharedDeviceManager};
use crate::error::{Result, StrataError};
use crate::types::SegmentId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskSegmentMeta {
    Single {
        length: u64,
        has_tombstones: bool,
        /// `(key_size, value_size)` for the fixed layout.
        fixed: Option<(u32, u32)>,
    },
    Multi {
        parts: Vec<SegmentId>,
    },
}

pub fn write(manager: &SharedDeviceManager, id: SegmentId, meta: &DiskSegmentMeta) -> Result<()> {
    let payload = bincode::serialize(meta)?;
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32_le(crc32fast::hash(&payload));

    let device = manager.create(id, DeviceCategory::DiskMeta, false)?;
    device.append(&buf)?;
    device.seal()
}

pub fn read(manager: &SharedDeviceManager, id: SegmentId) -> Result<DiskSegmentMeta> {
    let device = manager.open(id, DeviceCategory::DiskMeta, false)?;
    let bytes = device.read_at(0, device.len() as usize)?;
    let mut buf = &bytes[..];
    if buf.remaining() < 8 {
        return Err(StrataError::Corruption(format!(
            "metadata of segment {} is truncated",
            id
        )));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len + 4 {
        return Err(StrataError::Corruption(format!(
            "metadata of segment {} is truncated",
            id
        )));
    }
    let payload = &buf[..len];
    buf.advance(len);
    if crc32fast::hash(payload) != buf.get_u32_le() {
        return Err(StrataError::Corruption(format!(
            "metadata CRC mismatch for segment {}",
            id
        )));
    }
    Ok(bincode::deserialize(payload)?)
}
