//! Journal readers
//!
//! - [`JournalStreamReader`] scans a journal front to back and yields each
//!   entry once its last chunk has been read. Chunks of different entries
//!   may interleave; partial entries are kept until they complete.
//! - [`RandomAccessJournalReader`] fetches one entry by the offset its
//!   writer returned, following `next` links without scanning.
//!
//! A crash can leave the end of a journal torn. The stream reader treats a
//! bad chunk as the end of the log when nothing valid can follow it:
//! fewer bytes remain than a chunk header, a verified header whose chunk
//! runs past the end of the file, or every byte after it is zero. Any
//! other bad chunk is a [`Error::Corruption`]. Space stamped as reserved
//! belongs to an entry still being written (or abandoned by a crash) and
//! is skipped. The random-access reader has no such tolerance.

use super::format::{
    CHUNK_HEADER_SIZE, ChunkHeader, FILE_HEADER_SIZE, FileHeader, body_crc, xid_seed,
};
use crate::raw_io::{AccessMode, RandomAccessFile, RandomAccessIo};
use bytes::{Bytes, BytesMut};
use filestore_common::{Error, FsId, Result, Xid};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One logical journal entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub id: FsId,
    pub originator: i64,
    /// Offset of the entry's first chunk
    pub offset: u64,
    pub data: Bytes,
}

/// Read and check the file header, returning the declared transaction
fn read_file_header<R: RandomAccessIo>(io: &mut R, path: &Path, expected: Option<Xid>) -> Result<Xid> {
    if io.length()? < FILE_HEADER_SIZE {
        return Err(Error::corruption(path, 0, "journal shorter than its header"));
    }
    let mut raw = [0u8; FILE_HEADER_SIZE as usize];
    io.read_fully_at(0, &mut raw)?;
    let header = FileHeader::from_bytes(&raw).map_err(|reason| Error::corruption(path, 0, reason))?;
    if let Some(expected) = expected {
        if header.xid != expected {
            return Err(Error::XidMismatch {
                expected,
                found: header.xid,
            });
        }
    }
    Ok(header.xid)
}

/// Read just the declared transaction of a journal file
pub fn read_journal_xid(path: impl AsRef<Path>) -> Result<Xid> {
    let path = path.as_ref();
    let mut io = RandomAccessFile::open(path, AccessMode::Read)?;
    let xid = read_file_header(&mut io, path, None)?;
    io.close()?;
    Ok(xid)
}

/// Outcome of loading the chunk at one offset
enum ChunkLoad {
    Valid {
        header: ChunkHeader,
        id: Vec<u8>,
        payload: Vec<u8>,
    },
    /// Fewer bytes than a chunk header remain
    Short,
    /// Reserved space not written yet, ending at `end`
    Reserved { end: u64 },
    /// The chunk's extent runs past the end of the file
    PastEnd,
    /// A bad chunk; `after` is where anything following it would start
    Bad { reason: &'static str, after: u64 },
}

fn load_chunk<R: RandomAccessIo>(io: &mut R, seed: u32, pos: u64, len: u64) -> Result<ChunkLoad> {
    if len.saturating_sub(pos) < CHUNK_HEADER_SIZE as u64 {
        return Ok(ChunkLoad::Short);
    }
    let mut raw = [0u8; CHUNK_HEADER_SIZE];
    io.read_fully_at(pos, &mut raw)?;
    let after_header = pos + CHUNK_HEADER_SIZE as u64;
    let header = match ChunkHeader::from_bytes(&raw, pos, seed) {
        Ok(header) => header,
        Err(reason) => {
            return Ok(ChunkLoad::Bad {
                reason,
                after: after_header,
            });
        }
    };
    if header.is_reserved() {
        return Ok(ChunkLoad::Reserved { end: header.next });
    }
    if pos + header.extent() > len {
        return Ok(ChunkLoad::PastEnd);
    }
    let mut body = vec![0u8; usize::from(header.id_len) + header.length as usize];
    io.read_fully(&mut body)?;
    let payload = body.split_off(usize::from(header.id_len));
    if body_crc(seed, &body, &payload) != header.body_crc {
        return Ok(ChunkLoad::Bad {
            reason: "chunk checksum mismatch",
            after: pos + header.extent(),
        });
    }
    Ok(ChunkLoad::Valid {
        header,
        id: body,
        payload,
    })
}

fn parse_id(path: &Path, offset: u64, id: &[u8]) -> Result<FsId> {
    let text = std::str::from_utf8(id)
        .map_err(|_| Error::corruption(path, offset, "entry id is not UTF-8"))?;
    FsId::parse(text).map_err(|e| Error::corruption(path, offset, format!("bad entry id: {e}")))
}

/// An entry whose last chunk has not been read yet
struct Partial {
    id: FsId,
    originator: i64,
    next_sequence: u32,
    next_offset: u64,
    data: BytesMut,
}

/// Forward-only reader over a whole journal
pub struct JournalStreamReader<R: RandomAccessIo = RandomAccessFile> {
    io: R,
    path: PathBuf,
    xid: Xid,
    seed: u32,
    pos: u64,
    len: u64,
    pending: HashMap<u64, Partial>,
    peeked: Option<JournalEntry>,
    done: bool,
}

impl JournalStreamReader<RandomAccessFile> {
    /// Open a journal file, checking it was written by `expected`
    pub fn open(path: impl AsRef<Path>, expected: Xid) -> Result<Self> {
        let path = path.as_ref();
        let io = RandomAccessFile::open(path, AccessMode::Read)?;
        Self::new(io, path, expected)
    }
}

impl<R: RandomAccessIo> JournalStreamReader<R> {
    /// Read a journal through `io`; `path` is only used in error reports
    pub fn new(mut io: R, path: impl Into<PathBuf>, expected: Xid) -> Result<Self> {
        let path = path.into();
        let xid = read_file_header(&mut io, &path, Some(expected))?;
        let len = io.length()?;
        Ok(Self {
            io,
            path,
            xid,
            seed: xid_seed(&xid),
            pos: FILE_HEADER_SIZE,
            len,
            pending: HashMap::new(),
            peeked: None,
            done: false,
        })
    }

    #[must_use]
    pub const fn xid(&self) -> Xid {
        self.xid
    }

    /// True if another entry is available
    pub fn has_next(&mut self) -> Result<bool> {
        if self.peeked.is_none() {
            self.peeked = self.read_next()?;
        }
        Ok(self.peeked.is_some())
    }

    /// Next complete entry, or `None` at the end of the journal
    pub fn next_entry(&mut self) -> Result<Option<JournalEntry>> {
        if let Some(entry) = self.peeked.take() {
            return Ok(Some(entry));
        }
        self.read_next()
    }

    /// Release the underlying handle
    pub fn into_inner(self) -> R {
        self.io
    }

    fn finish(&mut self, reason: &str) {
        if !self.pending.is_empty() {
            warn!(
                path = %self.path.display(),
                incomplete = self.pending.len(),
                "dropping incomplete journal entries at end of log"
            );
        }
        debug!(path = %self.path.display(), offset = self.pos, reason, "end of journal");
        self.pending.clear();
        self.done = true;
    }

    /// True if every byte from `from` to the end of the file is zero
    fn zero_tail(&mut self, from: u64) -> Result<bool> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut at = from;
        while at < self.len {
            let n = usize::try_from((self.len - at).min(buf.len() as u64)).unwrap_or(buf.len());
            self.io.read_fully_at(at, &mut buf[..n])?;
            if buf[..n].iter().any(|&b| b != 0) {
                return Ok(false);
            }
            at += n as u64;
        }
        Ok(true)
    }

    fn read_next(&mut self) -> Result<Option<JournalEntry>> {
        while !self.done {
            if self.pos >= self.len {
                self.finish("end of file");
                break;
            }
            let offset = self.pos;
            let (header, id, payload) = match load_chunk(&mut self.io, self.seed, offset, self.len)? {
                ChunkLoad::Valid {
                    header,
                    id,
                    payload,
                } => (header, id, payload),
                ChunkLoad::Short => {
                    self.finish("partial chunk header");
                    break;
                }
                ChunkLoad::PastEnd => {
                    self.finish("chunk extends past end of file");
                    break;
                }
                ChunkLoad::Reserved { end } => {
                    debug!(path = %self.path.display(), offset, end, "skipping unwritten reservation");
                    self.pos = end;
                    continue;
                }
                ChunkLoad::Bad { reason, after } => {
                    if self.zero_tail(after)? {
                        self.finish(reason);
                        break;
                    }
                    self.done = true;
                    return Err(Error::corruption(&self.path, offset, reason));
                }
            };
            self.pos += header.extent();

            if header.is_first() {
                let id = parse_id(&self.path, offset, &id)?;
                if header.is_last() {
                    return Ok(Some(JournalEntry {
                        id,
                        originator: header.originator,
                        offset,
                        data: Bytes::from(payload),
                    }));
                }
                let mut data = BytesMut::with_capacity(payload.len() * 2);
                data.extend_from_slice(&payload);
                self.pending.insert(
                    offset,
                    Partial {
                        id,
                        originator: header.originator,
                        next_sequence: 1,
                        next_offset: header.next,
                        data,
                    },
                );
                continue;
            }

            let Some(partial) = self.pending.get_mut(&header.entry) else {
                self.done = true;
                return Err(Error::corruption(
                    &self.path,
                    offset,
                    "continuation chunk without a first chunk",
                ));
            };
            if partial.next_sequence != header.sequence || partial.next_offset != offset {
                self.done = true;
                return Err(Error::corruption(&self.path, offset, "chunk out of sequence"));
            }
            partial.data.extend_from_slice(&payload);
            if header.is_last() {
                if let Some(done) = self.pending.remove(&header.entry) {
                    return Ok(Some(JournalEntry {
                        id: done.id,
                        originator: done.originator,
                        offset: header.entry,
                        data: done.data.freeze(),
                    }));
                }
            } else {
                partial.next_sequence += 1;
                partial.next_offset = header.next;
            }
        }
        Ok(None)
    }
}

impl<R: RandomAccessIo> Iterator for JournalStreamReader<R> {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Reader fetching single entries by offset
pub struct RandomAccessJournalReader<R: RandomAccessIo> {
    io: R,
    path: PathBuf,
    xid: Xid,
    seed: u32,
}

impl RandomAccessJournalReader<RandomAccessFile> {
    /// Open a journal file, checking it was written by `expected`
    pub fn open(path: impl AsRef<Path>, expected: Xid) -> Result<Self> {
        let path = path.as_ref();
        let io = RandomAccessFile::open(path, AccessMode::Read)?;
        Self::new(io, path, expected)
    }
}

impl<R: RandomAccessIo> RandomAccessJournalReader<R> {
    pub fn new(mut io: R, path: impl Into<PathBuf>, expected: Xid) -> Result<Self> {
        let path = path.into();
        let xid = read_file_header(&mut io, &path, Some(expected))?;
        Ok(Self {
            io,
            path,
            xid,
            seed: xid_seed(&xid),
        })
    }

    #[must_use]
    pub const fn xid(&self) -> Xid {
        self.xid
    }

    /// Reassemble the entry whose first chunk is at `offset`
    pub fn read(&mut self, offset: u64) -> Result<JournalEntry> {
        let len = self.io.length()?;
        let mut data = BytesMut::new();
        let mut id = None;
        let mut originator = 0;
        let mut pos = offset;
        let mut sequence = 0u32;
        loop {
            let (header, id_bytes, payload) = match load_chunk(&mut self.io, self.seed, pos, len)? {
                ChunkLoad::Valid {
                    header,
                    id,
                    payload,
                } => (header, id, payload),
                ChunkLoad::Short | ChunkLoad::PastEnd => {
                    return Err(Error::corruption(&self.path, pos, "chunk runs past end of journal"));
                }
                ChunkLoad::Reserved { .. } => {
                    return Err(Error::corruption(&self.path, pos, "chunk reserved but not written"));
                }
                ChunkLoad::Bad { reason, .. } => {
                    return Err(Error::corruption(&self.path, pos, reason));
                }
            };
            if header.entry != offset || header.sequence != sequence {
                return Err(Error::corruption(
                    &self.path,
                    pos,
                    "chunk does not belong to the requested entry",
                ));
            }
            if sequence == 0 {
                id = Some(parse_id(&self.path, pos, &id_bytes)?);
                originator = header.originator;
            }
            data.extend_from_slice(&payload);
            if header.is_last() {
                break;
            }
            pos = header.next;
            sequence += 1;
        }
        let id = id.ok_or_else(|| Error::corruption(&self.path, offset, "entry has no id"))?;
        Ok(JournalEntry {
            id,
            originator,
            offset,
            data: data.freeze(),
        })
    }

    /// Release the underlying handle
    pub fn into_inner(self) -> R {
        self.io
    }
}
