//! STRATA - Topology Log
//! Append-only record of segment-topology transitions, replayed on open
//! to rebuild which segments are mutable, read-only, disk and bottom.
//!
//! Entry data is not stored here; it lives in the per-segment WALs and
//! the disk segment files.
//!
//! ## Files
//! ```text
//! topology.log       [len: u32 (LE)][bincode(LogEntry)][crc32: u32 (LE)] ...
//! topology.snapshot  [len: u32 (LE)][bincode(TopologyState)][crc32: u32 (LE)]
//! ```
//! Every log entry carries a sequence number one above its predecessor.
//! Every `threshold` records the current state is written to a temporary
//! file, renamed over the snapshot, and the log is truncated. The snapshot
//! remembers the last sequence it folded in, so entries left behind by a
//! crash before the truncate are skipped on replay.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::types::{OpIndex, SegmentId, EMPTY_SEGMENT_ID};

const LOG_FILE: &str = "topology.log";
const SNAPSHOT_FILE: &str = "topology.snapshot";
pub(crate) const SNAPSHOT_TMP_FILE: &str = "topology.snapshot.tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyOperation {
    NewMutableSegment,
    NewDiskSegment,
    EnqueueReadOnlySegment,
    DequeueReadOnlySegment,
    InsertBottomSegment,
    DeleteBottomSegment,
    EnqueueBottomSegment,
    DequeueBottomSegment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRecord {
    pub operation: TopologyOperation,
    pub segment_id: SegmentId,
    /// Bottom queue position for insert/delete; the op index counter for
    /// `NewMutableSegment` and `NewDiskSegment`; unused otherwise.
    pub index: u64,
}

impl TopologyRecord {
    pub fn new(operation: TopologyOperation, segment_id: SegmentId) -> Self {
        Self {
            operation,
            segment_id,
            index: 0,
        }
    }

    pub fn with_index(operation: TopologyOperation, segment_id: SegmentId, index: u64) -> Self {
        Self {
            operation,
            segment_id,
            index,
        }
    }
}

/// The segment ids making up an engine, as persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyState {
    pub mutable_segment: SegmentId,
    /// Oldest at the front.
    pub read_only: VecDeque<SegmentId>,
    pub disk_segment: SegmentId,
    /// Oldest at index 0.
    pub bottom: Vec<SegmentId>,
    pub max_segment_id: SegmentId,
    pub op_index: OpIndex,
    /// Sequence of the last log entry reflected in this state.
    pub sequence: u64,
}

impl TopologyState {
    pub fn apply(&mut self, record: &TopologyRecord) -> Result<()> {
        let id = record.segment_id;
        match record.operation {
            TopologyOperation::NewMutableSegment => {
                self.mutable_segment = id;
                self.op_index = self.op_index.max(record.index);
            }
            TopologyOperation::NewDiskSegment => {
                self.disk_segment = id;
                self.op_index = self.op_index.max(record.index);
            }
            TopologyOperation::EnqueueReadOnlySegment => self.read_only.push_back(id),
            TopologyOperation::DequeueReadOnlySegment => match self.read_only.pop_front() {
                Some(head) if head == id => {}
                other => {
                    return Err(StrataError::TopologyCorruption(format!(
                        "dequeue of read-only segment {} but queue head is {:?}",
                        id, other
                    )))
                }
            },
            TopologyOperation::InsertBottomSegment => {
                let index = record.index as usize;
                if index > self.bottom.len() {
                    return Err(StrataError::TopologyCorruption(format!(
                        "bottom segment {} inserted at {} past the end ({})",
                        id,
                        index,
                        self.bottom.len()
                    )));
                }
                self.bottom.insert(index, id);
            }
            TopologyOperation::DeleteBottomSegment => {
                let index = record.index as usize;
                if self.bottom.get(index) != Some(&id) {
                    return Err(StrataError::TopologyCorruption(format!(
                        "bottom segment {} is not at index {}",
                        id, index
                    )));
                }
                self.bottom.remove(index);
            }
            TopologyOperation::EnqueueBottomSegment => self.bottom.push(id),
            TopologyOperation::DequeueBottomSegment => {
                if self.bottom.first() != Some(&id) {
                    return Err(StrataError::TopologyCorruption(format!(
                        "dequeue of bottom segment {} but queue head is {:?}",
                        id,
                        self.bottom.first()
                    )));
                }
                self.bottom.remove(0);
            }
        }
        self.max_segment_id = self.max_segment_id.max(id);
        Ok(())
    }

    /// Check the ordering invariants: read-only ids strictly increase from
    /// head to tail, and the mutable segment is newer than all of them.
    pub fn validate(&self) -> Result<()> {
        let mut previous = EMPTY_SEGMENT_ID;
        for &id in &self.read_only {
            if id <= previous {
                return Err(StrataError::TopologyCorruption(format!(
                    "read-only segment {} follows {} in the queue",
                    id, previous
                )));
            }
            previous = id;
        }
        if self.mutable_segment != EMPTY_SEGMENT_ID && self.mutable_segment <= previous {
            return Err(StrataError::TopologyCorruption(format!(
                "mutable segment {} is not newer than read-only segment {}",
                self.mutable_segment, previous
            )));
        }
        Ok(())
    }

    /// Every segment id the topology references.
    pub fn referenced_ids(&self) -> Vec<SegmentId> {
        let mut ids: Vec<SegmentId> = self
            .read_only
            .iter()
            .chain(self.bottom.iter())
            .copied()
            .chain([self.mutable_segment, self.disk_segment])
            .filter(|&id| id != EMPTY_SEGMENT_ID)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    sequence: u64,
    record: TopologyRecord,
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.put_u32_le(crc32fast::hash(payload));
    buf
}

/// Split `bytes` into CRC-checked payloads. Returns the payloads and the
/// length of the valid prefix.
fn unframe(bytes: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut payloads = Vec::new();
    let mut buf = bytes;
    let mut valid = 0;
    while buf.remaining() >= 8 {
        let len = (&buf[..4]).get_u32_le() as usize;
        if buf.len() < len + 8 {
            break;
        }
        let payload = &buf[4..4 + len];
        let crc = (&buf[4 + len..8 + len]).get_u32_le();
        if crc32fast::hash(payload) != crc {
            break;
        }
        payloads.push(payload);
        buf = &buf[8 + len..];
        valid += 8 + len;
    }
    (payloads, valid)
}

pub struct TopologyLog {
    dir: PathBuf,
    file: File,
    state: TopologyState,
    records_since_snapshot: usize,
    threshold: usize,
    sync: bool,
}

impl TopologyLog {
    /// Load the snapshot, replay the log over it and validate the result.
    /// A torn log tail is cut off.
    pub fn open(dir: impl AsRef<Path>, threshold: usize, sync: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut state = Self::read_snapshot(&dir)?.unwrap_or_default();

        let log_path = dir.join(LOG_FILE);
        let mut bytes = Vec::new();
        if log_path.exists() {
            File::open(&log_path)?.read_to_end(&mut bytes)?;
        }
        let (payloads, valid) = unframe(&bytes);
        let records = payloads.len();
        let mut folded = 0;
        for payload in payloads {
            let entry: LogEntry = bincode::deserialize(payload)?;
            if entry.sequence <= state.sequence {
                folded += 1;
                continue;
            }
            if entry.sequence != state.sequence + 1 {
                return Err(StrataError::TopologyCorruption(format!(
                    "topology log jumps from sequence {} to {}",
                    state.sequence, entry.sequence
                )));
            }
            state.apply(&entry.record)?;
            state.sequence = entry.sequence;
        }
        state.validate()?;
        if folded > 0 {
            log::warn!(
                "Topology log repeats {} record(s) already in the snapshot; skipped",
                folded
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        if valid < bytes.len() {
            log::warn!(
                "Topology log has a torn tail: keeping {} of {} bytes",
                valid,
                bytes.len()
            );
            file.set_len(valid as u64)?;
        }

        log::debug!(
            "Topology loaded from {:?}: {} log records over snapshot",
            dir,
            records
        );

        Ok(Self {
            dir,
            file,
            state,
            records_since_snapshot: records,
            threshold: threshold.max(1),
            sync,
        })
    }

    fn read_snapshot(dir: &Path) -> Result<Option<TopologyState>> {
        let path = dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let (payloads, valid) = unframe(&bytes);
        match payloads.as_slice() {
            [payload] if valid == bytes.len() => Ok(Some(bincode::deserialize(payload)?)),
            _ => Err(StrataError::Corruption(format!(
                "topology snapshot {:?} is damaged",
                path
            ))),
        }
    }

    pub fn state(&self) -> &TopologyState {
        &self.state
    }

    /// Apply and persist a batch of records. The batch is written with a
    /// single write call.
    ///
    /// `Ok` means the batch is durable and applied. A failed compaction
    /// afterwards is only logged and retried on the next append.
    pub fn append(&mut self, records: &[TopologyRecord]) -> Result<()> {
        let mut next = self.state.clone();
        let mut buf = Vec::new();
        for &record in records {
            next.apply(&record)?;
            next.sequence += 1;
            let entry = LogEntry {
                sequence: next.sequence,
                record,
            };
            buf.extend_from_slice(&frame(&bincode::serialize(&entry)?));
        }
        let offset = self.file.metadata()?.len();
        if let Err(err) = self.write_batch(&buf) {
            if let Err(trim_err) = self.file.set_len(offset) {
                log::warn!("Failed to trim partial topology batch: {}", trim_err);
            }
            return Err(err);
        }
        self.state = next;
        self.records_since_snapshot += records.len();
        if self.records_since_snapshot >= self.threshold {
            if let Err(err) = self.compact() {
                log::warn!(
                    "Topology log compaction failed after {} records: {}",
                    self.records_since_snapshot,
                    err
                );
            }
        }
        Ok(())
    }

    fn write_batch(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        if self.sync {
            self.file.sync_data()?;
        } else {
            self.file.flush()?;
        }
        Ok(())
    }

    /// Fold the log into the snapshot file and start an empty log.
    pub fn compact(&mut self) -> Result<()> {
        let tmp = self.dir.join(SNAPSHOT_TMP_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&frame(&bincode::serialize(&self.state)?))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;

        self.file.set_len(0)?;
        log::debug!(
            "Topology log compacted after {} records",
            self.records_since_snapshot
        );
        self.records_since_snapshot = 0;
        Ok(())
    }

    pub fn records_since_snapshot(&self) -> usize {
        self.records_since_snapshot
    }
}
