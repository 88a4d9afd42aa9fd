//! Serial journal backend
//!
//! All appends go through one [`RandomAccessIo`] handle under a single
//! mutex, so reservation and copy never overlap. Lowest overhead for a
//! single writing thread, and usable over any handle (including an
//! in-memory one).

use super::format::reservation_marker;
use crate::raw_io::RandomAccessIo;
use filestore_common::Result;
use parking_lot::Mutex;

struct SerialState {
    io: Box<dyn RandomAccessIo>,
    end: u64,
}

pub(crate) struct SerialSink {
    state: Mutex<SerialState>,
}

impl SerialSink {
    /// Take over `io`, discarding its contents
    pub(crate) fn new(mut io: Box<dyn RandomAccessIo>) -> Result<Self> {
        io.set_length(0)?;
        Ok(Self {
            state: Mutex::new(SerialState { io, end: 0 }),
        })
    }

    /// Reserve `len` bytes, stamping them with a marker when `seed` is given
    pub(crate) fn reserve(&self, len: u64, seed: Option<u32>) -> Result<u64> {
        let mut state = self.state.lock();
        let offset = state.end;
        if let Some(seed) = seed {
            state.io.write_bytes_at(offset, &reservation_marker(offset, len, seed))?;
        }
        state.end += len;
        Ok(offset)
    }

    pub(crate) fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.state.lock().io.write_bytes_at(offset, buf)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.state.lock().io.sync()
    }

    pub(crate) fn end(&self) -> u64 {
        self.state.lock().end
    }

    pub(crate) fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        // a reservation at the tail may not have been written past its marker
        let end = state.end;
        if state.io.length()? < end {
            state.io.set_length(end)?;
        }
        state.io.close()
    }
}
