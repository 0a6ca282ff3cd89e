//! STRATA - Write-Ahead Log (WAL)
//! Provides durability for a mutable segment by logging every write to its
//! device before it is applied to the in-memory map. Each mutable segment
//! owns one log; the log is deleted with the segment after a merge.

use bytes::{Buf, BufMut};

use crate::device::{DeviceCategory, SharedDevice, SharedDeviceManager};
use crate::error::{Result, StrataError};
use crate::types::{OpIndex, SegmentId};

/// Operation type for WAL entries.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
enum OpType {
    Upsert = 1,
    Delete = 2,
}

impl OpType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(OpType::Upsert),
            2 => Some(OpType::Delete),
            _ => None,
        }
    }
}

/// Size of the fixed part of a record: op type, op index, two lengths, crc.
const RECORD_OVERHEAD: usize = 1 + 8 + 4 + 4 + 4;

/// A decoded WAL entry in serialized form.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Upsert {
        op_index: OpIndex,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        op_index: OpIndex,
        key: Vec<u8>,
    },
}

impl WalRecord {
    pub fn op_index(&self) -> OpIndex {
        match self {
            WalRecord::Upsert { op_index, .. } | WalRecord::Delete { op_index, .. } => *op_index,
        }
    }
}

/// Write-Ahead Log for crash recovery of one mutable segment.
///
/// ## Binary Format (per entry)
/// ```text
/// [op_type: 1 byte][op_index: 8 bytes (LE)][key_len: 4 bytes (LE)][key: N bytes]
/// [val_len: 4 bytes (LE)][value: M bytes][crc: 4 bytes (LE)]
/// ```
pub struct WriteAheadLog {
    segment_id: SegmentId,
    device: SharedDevice,
}

impl WriteAheadLog {
    /// Create a fresh log for a new segment.
    pub fn create(
        manager: &SharedDeviceManager,
        segment_id: SegmentId,
        sync_writes: bool,
    ) -> Result<Self> {
        let device = manager.create(segment_id, DeviceCategory::Wal, sync_writes)?;
        Ok(Self { segment_id, device })
    }

    /// Open the existing log of a recovered segment.
    pub fn open(
        manager: &SharedDeviceManager,
        segment_id: SegmentId,
        sync_writes: bool,
    ) -> Result<Self> {
        let device = if manager.exists(segment_id, DeviceCategory::Wal) {
            manager.open(segment_id, DeviceCategory::Wal, sync_writes)?
        } else {
            // An empty segment may never have written its log.
            manager.create(segment_id, DeviceCategory::Wal, sync_writes)?
        };
        Ok(Self { segment_id, device })
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    fn encode(op: OpType, op_index: OpIndex, key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_OVERHEAD + key.len() + value.len());
        buf.put_u8(op as u8);
        buf.put_u64_le(op_index);
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Append an UPSERT operation to the WAL.
    pub fn append_upsert(&self, op_index: OpIndex, key: &[u8], value: &[u8]) -> Result<()> {
        let encoded = Self::encode(OpType::Upsert, op_index, key, value);
        self.device.append(&encoded)?;
        Ok(())
    }

    /// Append a DELETE operation to the WAL.
    pub fn append_delete(&self, op_index: OpIndex, key: &[u8]) -> Result<()> {
        let encoded = Self::encode(OpType::Delete, op_index, key, &[]);
        self.device.append(&encoded)?;
        Ok(())
    }

    /// Read every intact record in write order.
    ///
    /// A torn or corrupt tail (crash mid-append) is cut off so later
    /// appends continue from the last good record.
    pub fn replay(&self) -> Result<Vec<WalRecord>> {
        let len = self.device.len() as usize;
        let bytes = self.device.read_at(0, len)?;
        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            match Self::decode(&bytes[offset..]) {
                Ok((record, consumed)) => {
                    records.push(record);
                    offset += consumed;
                }
                Err(err) => {
                    log::warn!(
                        "WAL of segment {} has a bad tail at offset {} ({}), truncating",
                        self.segment_id,
                        offset,
                        err
                    );
                    self.device.truncate(offset as u64)?;
                    break;
                }
            }
        }
        Ok(records)
    }

    fn decode(mut buf: &[u8]) -> Result<(WalRecord, usize)> {
        let start = buf;
        let truncated = || StrataError::Corruption("truncated WAL record".into());

        if buf.remaining() < 1 + 8 + 4 {
            return Err(truncated());
        }
        let op = OpType::from_byte(buf.get_u8())
            .ok_or_else(|| StrataError::Corruption("unknown WAL op type".into()))?;
        let op_index = buf.get_u64_le();
        let key_len = buf.get_u32_le() as usize;
        if buf.remaining() < key_len + 4 {
            return Err(truncated());
        }
        let key = buf[..key_len].to_vec();
        buf.advance(key_len);
        let val_len = buf.get_u32_le() as usize;
        if buf.remaining() < val_len + 4 {
            return Err(truncated());
        }
        let value = buf[..val_len].to_vec();
        buf.advance(val_len);

        let body_len = RECORD_OVERHEAD - 4 + key_len + val_len;
        let expected = buf.get_u32_le();
        if crc32fast::hash(&start[..body_len]) != expected {
            return Err(StrataError::Corruption("WAL record CRC mismatch".into()));
        }

        let record = match op {
            OpType::Upsert => WalRecord::Upsert {
                op_index,
                key,
                value,
            },
            OpType::Delete => WalRecord::Delete { op_index, key },
        };
        Ok((record, body_len + 4))
    }

    /// Make everything appended so far durable and immutable.
    pub fn seal(&self) -> Result<()> {
        self.device.seal()
    }

    /// Delete the log file (called after its segment was merged).
    pub fn delete(manager: &SharedDeviceManager, segment_id: SegmentId) -> Result<()> {
        manager.delete(segment_id, DeviceCategory::Wal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceManager, MemoryDeviceManager};
    use std::sync::Arc;

    fn manager() -> SharedDeviceManager {
        Arc::new(MemoryDeviceManager::new())
    }

    #[test]
    fn test_replay_in_order() {
        let manager = manager();
        let wal = WriteAheadLog::create(&manager, 1, false).unwrap();
        wal.append_upsert(1, b"a", b"1").unwrap();
        wal.append_delete(2, b"a").unwrap();
        wal.append_upsert(3, b"b", b"2").unwrap();

        let records = WriteAheadLog::open(&manager, 1, false).unwrap().replay().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[1],
            WalRecord::Delete {
                op_index: 2,
                key: b"a".to_vec()
            }
        );
        assert_eq!(records[2].op_index(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let manager = manager();
        let wal = WriteAheadLog::create(&manager, 2, false).unwrap();
        wal.append_upsert(1, b"key", b"value").unwrap();
        let good_len = manager.open(2, DeviceCategory::Wal, false).unwrap().len();
        // Half of a second record.
        let partial = WriteAheadLog::encode(OpType::Upsert, 2, b"key2", b"value2");
        wal.device.append(&partial[..partial.len() / 2]).unwrap();

        let records = wal.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(wal.device.len(), good_len);

        // Appends continue after the good prefix.
        wal.append_upsert(3, b"c", b"3").unwrap();
        assert_eq!(wal.replay().unwrap().len(), 2);
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut encoded = WriteAheadLog::encode(OpType::Upsert, 9, b"k", b"v");
        let last = encoded.len() - 5;
        encoded[last] ^= 0xFF;
        assert!(matches!(
            WriteAheadLog::decode(&encoded),
            Err(StrataError::Corruption(_))
        ));
    }

    #[test]
    fn test_missing_log_opens_empty() {
        let manager = manager();
        let wal = WriteAheadLog::open(&manager, 42, false).unwrap();
        assert!(wal.replay().unwrap().is_empty());
        WriteAheadLog::delete(&manager, 42).unwrap();
        assert!(!manager.exists(42, DeviceCategory::Wal));
    }
}
