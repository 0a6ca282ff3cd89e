//! STRATA - Random-Access Devices
//! Append-only byte stores backing WALs and disk segments.
//!
//! A device is created writable, grows through `append`, and becomes
//! immutable once sealed. Every device belongs to one segment and one
//! [`DeviceCategory`]; the [`DeviceManager`] maps that pair to storage.

pub mod file;
pub mod memory;

use std::sync::Arc;

use crate::error::Result;
use crate::types::SegmentId;

pub use file::FileDeviceManager;
pub use memory::MemoryDeviceManager;

/// Role of a device within its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCategory {
    /// Per-segment write-ahead log.
    Wal,
    /// Fixed-size entry headers of a disk segment.
    DiskHeader,
    /// Serialized keys and values of a disk segment.
    DiskData,
    /// Disk segment description.
    DiskMeta,
}

impl DeviceCategory {
    pub const ALL: [DeviceCategory; 4] = [
        DeviceCategory::Wal,
        DeviceCategory::DiskHeader,
        DeviceCategory::DiskData,
        DeviceCategory::DiskMeta,
    ];

    /// File extension used by file-backed managers.
    pub fn extension(self) -> &'static str {
        match self {
            DeviceCategory::Wal => "wal",
            DeviceCategory::DiskHeader => "dh",
            DeviceCategory::DiskData => "dd",
            DeviceCategory::DiskMeta => "meta",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        DeviceCategory::ALL
            .into_iter()
            .find(|category| category.extension() == ext)
    }
}

/// Append-only storage with random reads.
pub trait RandomAccessDevice: Send + Sync {
    /// Appends `bytes` and returns the offset they were written at.
    fn append(&self, bytes: &[u8]) -> Result<u64>;

    /// Reads exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Current length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops everything past `len`. Used to cut a torn WAL tail.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Flushes pending bytes and rejects further appends.
    fn seal(&self) -> Result<()>;

    fn is_sealed(&self) -> bool;
}

pub type SharedDevice = Arc<dyn RandomAccessDevice>;

/// Creates, opens and deletes the devices of segments.
pub trait DeviceManager: Send + Sync {
    /// Creates an empty device, replacing any leftover one.
    /// `durable` devices sync every append.
    fn create(&self, id: SegmentId, category: DeviceCategory, durable: bool)
        -> Result<SharedDevice>;

    /// Opens an existing device.
    fn open(&self, id: SegmentId, category: DeviceCategory, durable: bool) -> Result<SharedDevice>;

    fn exists(&self, id: SegmentId, category: DeviceCategory) -> bool;

    /// Deletes a device. Deleting a missing device is not an error.
    fn delete(&self, id: SegmentId, category: DeviceCategory) -> Result<()>;

    /// Ids of every segment that owns at least one device.
    fn segment_ids(&self) -> Result<Vec<SegmentId>>;
}

pub type SharedDeviceManager = Arc<dyn DeviceManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_round_trip() {
        for category in DeviceCategory::ALL {
            assert_eq!(
                DeviceCategory::from_extension(category.extension()),
                Some(category)
            );
        }
        assert_eq!(DeviceCategory::from_extension("tmp"), None);
    }
}
