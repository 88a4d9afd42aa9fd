//! Journal writer
//!
//! [`JournalWriter`] owns one journal file for one transaction and appends
//! entries in the chunked format of [`super::format`]. The physical backend
//! is chosen by [`WriterKind`]; all backends produce identical bytes for the
//! same sequence of operations.
//!
//! Two ways to append:
//! - [`JournalWriter::write`] for a payload of known size: all chunks are
//!   reserved as one contiguous range and written with a single call.
//! - [`JournalWriter::output_stream`] for a payload of unknown size: the
//!   first chunk is reserved immediately (its offset is the entry handle),
//!   and each following chunk is reserved only when the current one is full
//!   and more data arrives, so a chunk is always written with its final
//!   `next` link and never patched.
//!
//! Every reservation is stamped with a marker (see [`super::format`]) while
//! the reservation lock is held, so a reader scanning a live or crashed
//! journal can tell space still being filled from corruption.

use super::concurrent::ConcurrentSink;
use super::format::{
    ChunkHeader, ChunkSchedule, FILE_HEADER_SIZE, FLAG_FIRST, FLAG_LAST, FileHeader, chunk_extent,
    encode_chunk, xid_seed,
};
#[cfg(feature = "mmap-journal")]
use super::mapped::MappedSink;
use super::serial::SerialSink;
use crate::raw_io::{RandomAccessFile, RandomAccessIo};
use bytes::BytesMut;
use filestore_common::config::JournalConfig;
use filestore_common::{Error, FsId, Result, WriterKind, Xid};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Physical backend of a journal writer
enum Sink {
    Serial(SerialSink),
    Concurrent(ConcurrentSink),
    #[cfg(feature = "mmap-journal")]
    Mapped(MappedSink),
}

impl Sink {
    /// Reserve `len` bytes; with a seed the range is stamped as reserved
    /// before the reservation lock is released
    fn reserve(&self, len: u64, seed: Option<u32>) -> Result<u64> {
        match self {
            Self::Serial(s) => s.reserve(len, seed),
            Self::Concurrent(s) => s.reserve(len, seed),
            #[cfg(feature = "mmap-journal")]
            Self::Mapped(s) => s.reserve(len, seed),
        }
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            Self::Serial(s) => s.write_at(offset, buf),
            Self::Concurrent(s) => s.write_at(offset, buf),
            #[cfg(feature = "mmap-journal")]
            Self::Mapped(s) => s.write_at(offset, buf),
        }
    }

    fn sync(&self) -> Result<()> {
        match self {
            Self::Serial(s) => s.sync(),
            Self::Concurrent(s) => s.sync(),
            #[cfg(feature = "mmap-journal")]
            Self::Mapped(s) => s.sync(),
        }
    }

    fn end(&self) -> u64 {
        match self {
            Self::Serial(s) => s.end(),
            Self::Concurrent(s) => s.end(),
            #[cfg(feature = "mmap-journal")]
            Self::Mapped(s) => s.end(),
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            Self::Serial(s) => s.close(),
            Self::Concurrent(s) => s.close(),
            #[cfg(feature = "mmap-journal")]
            Self::Mapped(s) => s.close(),
        }
    }

    const fn kind(&self) -> WriterKind {
        match self {
            Self::Serial(_) => WriterKind::Serial,
            Self::Concurrent(_) => WriterKind::Concurrent,
            #[cfg(feature = "mmap-journal")]
            Self::Mapped(_) => WriterKind::Mmap,
        }
    }
}

/// Append-only writer of one transaction's journal file
pub struct JournalWriter {
    path: PathBuf,
    xid: Xid,
    seed: u32,
    schedule: ChunkSchedule,
    sink: Sink,
    closed: AtomicBool,
    open_streams: AtomicUsize,
}

impl JournalWriter {
    /// Create (or truncate) a journal file with the configured backend
    pub fn create(path: impl AsRef<Path>, xid: Xid, config: &JournalConfig) -> Result<Self> {
        let path = path.as_ref();
        let schedule = ChunkSchedule::new(config.chunk_schedule.clone())?;
        let sink = match config.writer {
            WriterKind::Serial => Sink::Serial(SerialSink::new(Box::new(
                RandomAccessFile::create(path)?,
            ))?),
            WriterKind::Concurrent => Sink::Concurrent(ConcurrentSink::create(path)?),
            #[cfg(feature = "mmap-journal")]
            WriterKind::Mmap => Sink::Mapped(MappedSink::create(path, config.mmap_grow_bytes)?),
            #[cfg(not(feature = "mmap-journal"))]
            WriterKind::Mmap => {
                return Err(Error::configuration(
                    "memory-mapped journal writer requires the mmap-journal feature",
                ));
            }
        };
        Self::start(path.to_path_buf(), xid, schedule, sink)
    }

    /// Serial writer over an arbitrary handle; its contents are discarded
    pub fn with_io(
        io: Box<dyn RandomAccessIo>,
        path: impl Into<PathBuf>,
        xid: Xid,
        schedule: ChunkSchedule,
    ) -> Result<Self> {
        Self::start(path.into(), xid, schedule, Sink::Serial(SerialSink::new(io)?))
    }

    fn start(path: PathBuf, xid: Xid, schedule: ChunkSchedule, sink: Sink) -> Result<Self> {
        let at = sink.reserve(FILE_HEADER_SIZE, None)?;
        sink.write_at(at, &FileHeader::new(xid).to_bytes())?;
        debug!(path = %path.display(), %xid, kind = ?sink.kind(), "created journal");
        Ok(Self {
            path,
            xid,
            seed: xid_seed(&xid),
            schedule,
            sink,
            closed: AtomicBool::new(false),
            open_streams: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub const fn xid(&self) -> Xid {
        self.xid
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn kind(&self) -> WriterKind {
        self.sink.kind()
    }

    /// Reserved length of the journal
    #[must_use]
    pub fn len(&self) -> u64 {
        self.sink.end()
    }

    /// True if nothing but the file header was written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= FILE_HEADER_SIZE
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(self.path.display().to_string()));
        }
        Ok(())
    }

    /// Append a complete entry and return the offset of its first chunk
    pub fn write(&self, id: &FsId, originator: i64, data: &[u8]) -> Result<u64> {
        self.check_open()?;
        let id_bytes = id_bytes(id)?;
        let plan = self.schedule.plan(data.len());
        let total: u64 = plan
            .iter()
            .enumerate()
            .map(|(seq, &cap)| chunk_extent(if seq == 0 { id_bytes.len() } else { 0 }, cap))
            .sum();
        let base = self.sink.reserve(total, Some(self.seed))?;

        let mut buf = BytesMut::with_capacity(usize::try_from(total).unwrap_or(0));
        let mut offset = base;
        let mut consumed = 0usize;
        let last_seq = plan.len() - 1;
        for (seq, &capacity) in plan.iter().enumerate() {
            let first = seq == 0;
            let id_part: &[u8] = if first { id_bytes } else { &[] };
            let extent = chunk_extent(id_part.len(), capacity);
            let header = ChunkHeader {
                flags: chunk_flags(first, seq == last_seq),
                id_len: id_len(id_part),
                entry: base,
                sequence: u32::try_from(seq).map_err(|_| Error::invalid_argument("entry too large"))?,
                capacity,
                length: capacity,
                next: if seq == last_seq { 0 } else { offset + extent },
                originator,
                body_crc: 0,
            };
            let end = consumed + capacity as usize;
            encode_chunk(&mut buf, self.seed, &header, id_part, &data[consumed..end]);
            consumed = end;
            offset += extent;
        }
        self.sink.write_at(base, &buf)?;
        debug!(%id, offset = base, len = data.len(), chunks = plan.len(), "journaled entry");
        Ok(base)
    }

    /// Open a streaming entry borrowing this writer
    pub fn output_stream(&self, id: &FsId, originator: i64) -> Result<JournalOutputStream<&Self>> {
        JournalOutputStream::open(self, id, originator)
    }

    /// Open a streaming entry that keeps the writer alive
    pub fn output_stream_owned(
        self: &Arc<Self>,
        id: &FsId,
        originator: i64,
    ) -> Result<JournalOutputStream<Arc<Self>>> {
        JournalOutputStream::open(Arc::clone(self), id, originator)
    }

    /// Number of output streams not yet closed
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::Acquire)
    }

    /// Flush everything written so far to stable storage
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.sink.sync()
    }

    /// Close the journal. Fails while output streams are still open;
    /// closing twice is not an error.
    pub fn close(&self) -> Result<()> {
        let streams = self.open_streams();
        if streams > 0 {
            return Err(Error::invalid_argument(format!(
                "{streams} output streams still open on {}",
                self.path.display()
            )));
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sink.close()?;
        debug!(path = %self.path.display(), len = self.len(), "closed journal");
        Ok(())
    }

    fn write_chunk(&self, offset: u64, header: &ChunkHeader, id: &[u8], payload: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut buf = BytesMut::with_capacity(usize::try_from(header.extent()).unwrap_or(0));
        encode_chunk(&mut buf, self.seed, header, id, payload);
        self.sink.write_at(offset, &buf)
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.open_streams.store(0, Ordering::Release);
            if let Err(e) = self.close() {
                warn!(path = %self.path.display(), "failed to close journal: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter")
            .field("path", &self.path)
            .field("xid", &self.xid)
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}

fn id_bytes(id: &FsId) -> Result<&[u8]> {
    let bytes = id.as_str().as_bytes();
    if bytes.len() > usize::from(u16::MAX) {
        return Err(Error::InvalidFsId(format!("{} bytes is too long", bytes.len())));
    }
    Ok(bytes)
}

fn id_len(id: &[u8]) -> u16 {
    u16::try_from(id.len()).unwrap_or(u16::MAX)
}

const fn chunk_flags(first: bool, last: bool) -> u8 {
    let mut flags = 0;
    if first {
        flags |= FLAG_FIRST;
    }
    if last {
        flags |= FLAG_LAST;
    }
    flags
}

/// The chunk currently being filled by a stream
struct OpenChunk {
    offset: u64,
    sequence: u32,
    capacity: u32,
    buf: Vec<u8>,
}

/// Streaming writer of one journal entry
///
/// Bytes are buffered up to the current chunk's capacity. [`close`] writes
/// the final chunk; dropping an unclosed stream closes it on a best-effort
/// basis.
///
/// [`close`]: JournalOutputStream::close
pub struct JournalOutputStream<W: Deref<Target = JournalWriter>> {
    writer: W,
    id: FsId,
    originator: i64,
    entry: u64,
    /// Offset of the chunk being filled, or of the last chunk once closed
    tail: u64,
    chunk: Option<OpenChunk>,
}

impl<W: Deref<Target = JournalWriter>> JournalOutputStream<W> {
    fn open(writer: W, id: &FsId, originator: i64) -> Result<Self> {
        writer.check_open()?;
        let id_part = id_bytes(id)?;
        let capacity = writer.schedule.capacity(0);
        let entry = writer
            .sink
            .reserve(chunk_extent(id_part.len(), capacity), Some(writer.seed))?;
        writer.open_streams.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            writer,
            id: id.clone(),
            originator,
            entry,
            tail: entry,
            chunk: Some(OpenChunk {
                offset: entry,
                sequence: 0,
                capacity,
                buf: Vec::with_capacity(capacity as usize),
            }),
        })
    }

    /// Offset of the entry's first chunk
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.entry
    }

    /// Offset of the entry's current last chunk. Entries replay in the
    /// order of their last chunks.
    #[must_use]
    pub const fn last_chunk_offset(&self) -> u64 {
        self.tail
    }

    #[must_use]
    pub const fn id(&self) -> &FsId {
        &self.id
    }

    fn flush_chunk(&self, chunk: &OpenChunk, next: Option<u64>) -> Result<()> {
        let first = chunk.sequence == 0;
        let id_part: &[u8] = if first { self.id.as_str().as_bytes() } else { &[] };
        let header = ChunkHeader {
            flags: chunk_flags(first, next.is_none()),
            id_len: id_len(id_part),
            entry: self.entry,
            sequence: chunk.sequence,
            capacity: chunk.capacity,
            length: u32::try_from(chunk.buf.len()).unwrap_or(chunk.capacity),
            next: next.unwrap_or(0),
            originator: self.originator,
            body_crc: 0,
        };
        self.writer.write_chunk(chunk.offset, &header, id_part, &chunk.buf)
    }

    /// Append bytes to the entry
    pub fn write_all_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        let Some(mut chunk) = self.chunk.take() else {
            return Err(Error::Closed(format!("output stream for {}", self.id)));
        };
        while !data.is_empty() {
            if chunk.buf.len() == chunk.capacity as usize {
                let sequence = chunk.sequence + 1;
                let capacity = self.writer.schedule.capacity(sequence);
                let next = match self
                    .writer
                    .sink
                    .reserve(chunk_extent(0, capacity), Some(self.writer.seed))
                {
                    Ok(next) => next,
                    Err(e) => {
                        self.chunk = Some(chunk);
                        return Err(e);
                    }
                };
                if let Err(e) = self.flush_chunk(&chunk, Some(next)) {
                    self.chunk = Some(chunk);
                    return Err(e);
                }
                chunk.offset = next;
                self.tail = next;
                chunk.sequence = sequence;
                chunk.capacity = capacity;
                chunk.buf.clear();
            }
            let room = chunk.capacity as usize - chunk.buf.len();
            let take = room.min(data.len());
            chunk.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        self.chunk = Some(chunk);
        Ok(())
    }

    /// Write the final chunk and return the entry offset
    pub fn close(&mut self) -> Result<u64> {
        let Some(chunk) = self.chunk.take() else {
            return Ok(self.entry);
        };
        self.writer.open_streams.fetch_sub(1, Ordering::AcqRel);
        self.flush_chunk(&chunk, None)?;
        debug!(id = %self.id, offset = self.entry, chunks = chunk.sequence + 1, "closed journal stream");
        Ok(self.entry)
    }
}

impl<W: Deref<Target = JournalWriter>> std::io::Write for JournalOutputStream<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_all_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<W: Deref<Target = JournalWriter>> Drop for JournalOutputStream<W> {
    fn drop(&mut self) {
        if self.chunk.is_some() {
            if let Err(e) = self.close() {
                warn!(id = %self.id, "failed to close journal stream: {}", e);
            }
        }
    }
}
