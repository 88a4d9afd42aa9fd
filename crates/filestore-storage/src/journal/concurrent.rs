//! Lock-coordinated concurrent journal backend
//!
//! Only the offset reservation (and its marker) takes the lock. Payload
//! copies use positional writes through [`PositionalIo`], so writers
//! filling disjoint reserved ranges proceed in parallel.

use super::format::reservation_marker;
use crate::raw_io::{PositionalIo, RandomAccessFile, RandomAccessIo};
use filestore_common::Result;
use parking_lot::Mutex;
use std::path::Path;

pub(crate) struct ConcurrentSink {
    file: RandomAccessFile,
    /// Reserved end of the journal
    end: Mutex<u64>,
}

impl ConcurrentSink {
    pub(crate) fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            file: RandomAccessFile::create(path)?,
            end: Mutex::new(0),
        })
    }

    pub(crate) fn reserve(&self, len: u64, seed: Option<u32>) -> Result<u64> {
        let mut end = self.end.lock();
        let offset = *end;
        if let Some(seed) = seed {
            self.file.write_all_at(offset, &reservation_marker(offset, len, seed))?;
        }
        *end += len;
        Ok(offset)
    }

    pub(crate) fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(offset, buf)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_shared()
    }

    pub(crate) fn end(&self) -> u64 {
        *self.end.lock()
    }

    pub(crate) fn close(&self) -> Result<()> {
        let end = *self.end.lock();
        if self.file.length()? < end {
            self.file.resize(end)?;
        }
        Ok(())
    }
}
