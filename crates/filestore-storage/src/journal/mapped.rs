//! Memory-mapped journal backend (`mmap-journal` feature)
//!
//! The file is grown in `grow` sized steps and written through a shared
//! mapping. Copies into reserved ranges hold the mapping's read lock;
//! growing takes the write lock, so the mapping is never replaced while a
//! copy is in flight. On close the mapping is dropped and the file is
//! truncated to the reserved end, which makes the output identical to the
//! other backends. Copies go through the mapping rather than
//! [`RandomAccessIo`](crate::raw_io::RandomAccessIo); sizing and the
//! mapping itself use the underlying [`RandomAccessFile`].

use super::format::reservation_marker;
use crate::raw_io::{PositionalIo, RandomAccessFile};
use filestore_common::{Error, Result};
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use tracing::debug;

struct Mapping {
    map: Option<MmapMut>,
    /// Taken from `map.as_mut_ptr()` under the write lock
    base: *mut u8,
    len: usize,
}

// SAFETY: `base` points into `map`, which lives as long as the Mapping.
// Writers copy into disjoint reserved ranges under the read lock.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

pub(crate) struct MappedSink {
    file: RandomAccessFile,
    mapping: RwLock<Mapping>,
    end: Mutex<u64>,
    grow: u64,
}

impl MappedSink {
    pub(crate) fn create(path: &Path, grow: u64) -> Result<Self> {
        let file = RandomAccessFile::create(path)?;
        let sink = Self {
            file,
            mapping: RwLock::new(Mapping {
                map: None,
                base: std::ptr::null_mut(),
                len: 0,
            }),
            end: Mutex::new(0),
            grow: grow.max(super::format::FILE_HEADER_SIZE),
        };
        sink.remap(sink.grow)?;
        Ok(sink)
    }

    fn remap(&self, min_len: u64) -> Result<()> {
        let mut mapping = self.mapping.write();
        if mapping.len as u64 >= min_len {
            return Ok(());
        }
        let new_len = min_len.div_ceil(self.grow) * self.grow;
        let len = usize::try_from(new_len)
            .map_err(|_| Error::storage(format!("journal of {new_len} bytes cannot be mapped")))?;
        mapping.map = None;
        mapping.base = std::ptr::null_mut();
        mapping.len = 0;
        self.file.resize(new_len)?;
        // SAFETY: the journal file is owned by this writer and is not
        // truncated below the mapped length while the mapping exists.
        let mut map = unsafe { MmapMut::map_mut(self.file.as_file()?)? };
        mapping.base = map.as_mut_ptr();
        mapping.len = len;
        mapping.map = Some(map);
        debug!(len = new_len, "remapped journal");
        Ok(())
    }

    pub(crate) fn reserve(&self, len: u64, seed: Option<u32>) -> Result<u64> {
        let mut end = self.end.lock();
        let offset = *end;
        self.remap(offset + len)?;
        if let Some(seed) = seed {
            self.write_at(offset, &reservation_marker(offset, len, seed))?;
        }
        *end = offset + len;
        Ok(offset)
    }

    pub(crate) fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mapping = self.mapping.read();
        let start = usize::try_from(offset).map_err(|_| Error::internal("offset overflow"))?;
        if mapping.map.is_none() || start + buf.len() > mapping.len {
            return Err(Error::internal(format!(
                "write of {} bytes at {offset} outside mapped journal",
                buf.len()
            )));
        }
        // SAFETY: the range lies inside the live mapping and was handed out
        // by `reserve` to exactly one caller.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), mapping.base.add(start), buf.len());
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        let mapping = self.mapping.read();
        if let Some(map) = &mapping.map {
            map.flush()?;
        }
        Ok(())
    }

    pub(crate) fn end(&self) -> u64 {
        *self.end.lock()
    }

    pub(crate) fn close(&self) -> Result<()> {
        let end = *self.end.lock();
        let mut mapping = self.mapping.write();
        if let Some(map) = mapping.map.take() {
            map.flush()?;
        }
        mapping.base = std::ptr::null_mut();
        mapping.len = 0;
        self.file.resize(end)?;
        Ok(())
    }
}
