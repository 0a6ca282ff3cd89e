//! STRATA - File Devices
//! Devices stored as `{segment_id}.{extension}` files in the data directory.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{DeviceCategory, DeviceManager, RandomAccessDevice, SharedDevice};
use crate::error::{Result, StrataError};
use crate::types::SegmentId;

/// Appends are buffered up to this many bytes before hitting the file.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

struct FileState {
    file: File,
    /// Bytes appended but not yet written to `file`.
    pending: Vec<u8>,
    /// Length of the data that reached `file`.
    flushed_len: u64,
}

impl FileState {
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.flushed_len))?;
        self.file.write_all(&self.pending)?;
        self.flushed_len += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }
}

/// A device backed by one file.
pub struct FileDevice {
    path: PathBuf,
    state: Mutex<FileState>,
    len: AtomicU64,
    sealed: AtomicBool,
    durable: bool,
}

impl FileDevice {
    fn create(path: PathBuf, durable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self::from_file(path, file, 0, durable))
    }

    fn open(path: PathBuf, durable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self::from_file(path, file, len, durable))
    }

    fn from_file(path: PathBuf, file: File, len: u64, durable: bool) -> Self {
        Self {
            path,
            state: Mutex::new(FileState {
                file,
                pending: Vec::new(),
                flushed_len: len,
            }),
            len: AtomicU64::new(len),
            sealed: AtomicBool::new(false),
            durable,
        }
    }

    /// Returns the path to the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RandomAccessDevice for FileDevice {
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        if self.is_sealed() {
            return Err(StrataError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("device {:?} is sealed", self.path),
            )));
        }
        let mut state = self.state.lock();
        let offset = state.flushed_len + state.pending.len() as u64;
        state.pending.extend_from_slice(bytes);
        if self.durable {
            state.flush()?;
            state.file.sync_data()?;
        } else if state.pending.len() >= WRITE_BUFFER_SIZE {
            state.flush()?;
        }
        self.len.store(offset + bytes.len() as u64, Ordering::Release);
        Ok(offset)
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if offset + len as u64 > state.flushed_len {
            state.flush()?;
        }
        let mut buf = vec![0u8; len];
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.flush()?;
        state.file.set_len(len)?;
        state.file.sync_all()?;
        state.flushed_len = len;
        self.len.store(len, Ordering::Release);
        Ok(())
    }

    fn seal(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.flush()?;
        state.file.sync_all()?;
        self.sealed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Err(err) = state.flush() {
            log::error!("Failed to flush device {:?} on close: {}", self.path, err);
        }
    }
}

/// Maps segment devices to files under one directory.
pub struct FileDeviceManager {
    dir: PathBuf,
}

impl FileDeviceManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: SegmentId, category: DeviceCategory) -> PathBuf {
        self.dir.join(format!("{}.{}", id, category.extension()))
    }
}

impl DeviceManager for FileDeviceManager {
    fn create(
        &self,
        id: SegmentId,
        category: DeviceCategory,
        durable: bool,
    ) -> Result<SharedDevice> {
        Ok(Arc::new(FileDevice::create(self.path(id, category), durable)?))
    }

    fn open(&self, id: SegmentId, category: DeviceCategory, durable: bool) -> Result<SharedDevice> {
        let path = self.path(id, category);
        if !path.exists() {
            return Err(StrataError::SegmentNotFound(id));
        }
        Ok(Arc::new(FileDevice::open(path, durable)?))
    }

    fn exists(&self, id: SegmentId, category: DeviceCategory) -> bool {
        self.path(id, category).exists()
    }

    fn delete(&self, id: SegmentId, category: DeviceCategory) -> Result<()> {
        match fs::remove_file(self.path(id, category)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn segment_ids(&self) -> Result<Vec<SegmentId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            if DeviceCategory::from_extension(ext).is_none() {
                continue;
            }
            if let Ok(id) = stem.parse::<SegmentId>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}
