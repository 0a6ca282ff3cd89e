//! STRATA - In-Memory Devices
//! Volatile devices for tests and ephemeral engines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{DeviceCategory, DeviceManager, RandomAccessDevice, SharedDevice};
use crate::error::{Result, StrataError};
use crate::types::SegmentId;

/// A device holding its bytes in a vector.
#[derive(Default)]
pub struct MemoryDevice {
    bytes: RwLock<Vec<u8>>,
    sealed: AtomicBool,
}

impl RandomAccessDevice for MemoryDevice {
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        if self.is_sealed() {
            return Err(StrataError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "memory device is sealed",
            )));
        }
        let mut data = self.bytes.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.bytes.read();
        let start = offset as usize;
        let end = start + len;
        if end > data.len() {
            return Err(StrataError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read {}..{} past device end {}", start, end, data.len()),
            )));
        }
        Ok(data[start..end].to_vec())
    }

    fn len(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.bytes.write().truncate(len as usize);
        Ok(())
    }

    fn seal(&self) -> Result<()> {
        self.sealed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

/// Keeps every device in a map keyed by segment and category.
#[derive(Default)]
pub struct MemoryDeviceManager {
    devices: Mutex<HashMap<(SegmentId, DeviceCategory), Arc<MemoryDevice>>>,
}

impl MemoryDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live devices.
    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}

impl DeviceManager for MemoryDeviceManager {
    fn create(
        &self,
        id: SegmentId,
        category: DeviceCategory,
        _durable: bool,
    ) -> Result<SharedDevice> {
        let device = Arc::new(MemoryDevice::default());
        self.devices.lock().insert((id, category), device.clone());
        Ok(device)
    }

    fn open(&self, id: SegmentId, category: DeviceCategory, _durable: bool) -> Result<SharedDevice> {
        match self.devices.lock().get(&(id, category)) {
            Some(device) => {
                let device: SharedDevice = device.clone();
                Ok(device)
            }
            None => Err(StrataError::SegmentNotFound(id)),
        }
    }

    fn exists(&self, id: SegmentId, category: DeviceCategory) -> bool {
        self.devices.lock().contains_key(&(id, category))
    }

    fn delete(&self, id: SegmentId, category: DeviceCategory) -> Result<()> {
        self.devices.lock().remove(&(id, category));
        Ok(())
    }

    fn segment_ids(&self) -> Result<Vec<SegmentId>> {
        let mut ids: Vec<SegmentId> = self.devices.lock().keys().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}
