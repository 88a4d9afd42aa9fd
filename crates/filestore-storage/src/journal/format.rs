//! Journal on-disk format
//!
//! File header (48 bytes):
//! ```text
//! +-------+---------+----------+-------------+-------------+--------+-----+
//! | Magic | Version | Reserved | Xid global  | Xid branch  | CRC32C | Pad |
//! | 4B    | 2B      | 2B       | 16B         | 16B         | 4B     | 4B  |
//! +-------+---------+----------+-------------+-------------+--------+-----+
//! ```
//!
//! Chunk (52-byte header, then the id on the first chunk, then payload):
//! ```text
//! +-------+-------+-----+-------+-------+-----+-----+-----+------+------------+---------+---------+
//! | Magic | Flags | Rsv | IdLen | Entry | Seq | Cap | Len | Next | Originator | BodyCRC | HeadCRC |
//! | 4B    | 1B    | 1B  | 2B    | 8B    | 4B  | 4B  | 4B  | 8B   | 8B         | 4B      | 4B      |
//! +-------+-------+-----+-------+-------+-----+-----+-----+------+------------+---------+---------+
//! | FsId bytes (IdLen) | payload (Len) | zero padding (Cap - Len)                                  |
//! +----------------------------------------------------------------------------------------------+
//! ```
//!
//! `Entry` is the offset of the entry's first chunk and `Next` the offset of
//! the following chunk (0 on the last one). `BodyCRC` covers the id and the
//! used payload. `HeadCRC` covers the 48 header bytes before it, so sizes
//! and links are verified before they are trusted. Both are seeded with the
//! CRC32C of the file's Xid, so a chunk only verifies inside its own
//! transaction's journal.
//!
//! Reserved space is stamped with a header carrying only [`FLAG_RESERVED`]
//! and `Next` set to the end of the reservation. The real chunks overwrite
//! it; a reader that meets the stamp knows the range is still being written
//! and how far to skip.

use bytes::{BufMut, BytesMut};
use filestore_common::{Error, Result, Xid};

/// Journal file header magic number
pub const JOURNAL_MAGIC: u32 = 0x4653_4A48; // "FSJH"

/// Chunk header magic number
pub const CHUNK_MAGIC: u32 = 0x4653_4A43; // "FSJC"

/// Current format version
pub const JOURNAL_VERSION: u16 = 1;

/// File header size
pub const FILE_HEADER_SIZE: u64 = 48;

/// Chunk header size
pub const CHUNK_HEADER_SIZE: usize = 52;

/// Offset of the CRC field in the file header
const FILE_CRC_OFFSET: usize = 40;
const BODY_CRC_OFFSET: usize = 44;
const HEAD_CRC_OFFSET: usize = 48;

/// First chunk of an entry; carries the FsId
pub const FLAG_FIRST: u8 = 0x01;
/// Last chunk of an entry
pub const FLAG_LAST: u8 = 0x02;
/// Space reserved for chunks not written yet
pub const FLAG_RESERVED: u8 = 0x04;

/// CRC seed binding chunks to a transaction
#[must_use]
pub fn xid_seed(xid: &Xid) -> u32 {
    crc32c::crc32c(&xid.to_bytes())
}

/// Journal file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub xid: Xid,
}

impl FileHeader {
    #[must_use]
    pub const fn new(xid: Xid) -> Self {
        Self {
            version: JOURNAL_VERSION,
            xid,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[8..40].copy_from_slice(&self.xid.to_bytes());
        let crc = crc32c::crc32c(&buf[..FILE_CRC_OFFSET]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse a header; the error is a short reason for a corruption report
    pub fn from_bytes(buf: &[u8; FILE_HEADER_SIZE as usize]) -> std::result::Result<Self, &'static str> {
        if le_u32(buf, 0) != JOURNAL_MAGIC {
            return Err("bad journal magic");
        }
        if le_u32(buf, FILE_CRC_OFFSET) != crc32c::crc32c(&buf[..FILE_CRC_OFFSET]) {
            return Err("journal header checksum mismatch");
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != JOURNAL_VERSION {
            return Err("unsupported journal version");
        }
        let mut xid = [0u8; Xid::ENCODED_LEN];
        xid.copy_from_slice(&buf[8..40]);
        Ok(Self {
            version,
            xid: Xid::from_bytes(&xid),
        })
    }
}

/// Chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: u8,
    pub id_len: u16,
    pub entry: u64,
    pub sequence: u32,
    pub capacity: u32,
    pub length: u32,
    pub next: u64,
    pub originator: i64,
    pub body_crc: u32,
}

impl ChunkHeader {
    #[must_use]
    pub const fn is_first(&self) -> bool {
        self.flags & FLAG_FIRST != 0
    }

    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.flags & FLAG_RESERVED != 0
    }

    /// Bytes this chunk (or reservation) occupies in the file
    #[must_use]
    pub const fn extent(&self) -> u64 {
        if self.is_reserved() {
            return self.next.saturating_sub(self.entry);
        }
        chunk_extent(self.id_len as usize, self.capacity)
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(CHUNK_MAGIC);
        buf.put_u8(self.flags);
        buf.put_u8(0);
        buf.put_u16_le(self.id_len);
        buf.put_u64_le(self.entry);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.capacity);
        buf.put_u32_le(self.length);
        buf.put_u64_le(self.next);
        buf.put_i64_le(self.originator);
        buf.put_u32_le(self.body_crc);
    }

    /// The complete header with its own checksum appended
    fn encode(&self, seed: u32) -> [u8; CHUNK_HEADER_SIZE] {
        let mut head = BytesMut::with_capacity(CHUNK_HEADER_SIZE);
        self.put(&mut head);
        let crc = crc32c::crc32c_append(seed, &head);
        head.put_u32_le(crc);
        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        raw.copy_from_slice(&head);
        raw
    }

    /// Parse a chunk header read at `offset`. The header checksum is
    /// verified before any field is looked at; the body checksum is checked
    /// separately with [`body_crc`] once the id and payload are available.
    pub fn from_bytes(
        buf: &[u8; CHUNK_HEADER_SIZE],
        offset: u64,
        seed: u32,
    ) -> std::result::Result<Self, &'static str> {
        if le_u32(buf, 0) != CHUNK_MAGIC {
            return Err("bad chunk magic");
        }
        if le_u32(buf, HEAD_CRC_OFFSET) != crc32c::crc32c_append(seed, &buf[..HEAD_CRC_OFFSET]) {
            return Err("chunk header checksum mismatch");
        }
        let header = Self {
            flags: buf[4],
            id_len: u16::from_le_bytes([buf[6], buf[7]]),
            entry: le_u64(buf, 8),
            sequence: le_u32(buf, 16),
            capacity: le_u32(buf, 20),
            length: le_u32(buf, 24),
            next: le_u64(buf, 28),
            originator: le_u64(buf, 36).cast_signed(),
            body_crc: le_u32(buf, BODY_CRC_OFFSET),
        };
        if header.flags == FLAG_RESERVED {
            if header.entry != offset || header.next < offset + CHUNK_HEADER_SIZE as u64 {
                return Err("inconsistent reservation");
            }
            return Ok(header);
        }
        if header.flags & !(FLAG_FIRST | FLAG_LAST) != 0 {
            return Err("unknown chunk flags");
        }
        if header.length > header.capacity {
            return Err("chunk length exceeds capacity");
        }
        if header.is_first() != (header.id_len > 0) {
            return Err("id present on wrong chunk");
        }
        if header.is_first() != (header.sequence == 0) || header.is_first() != (header.entry == offset) {
            return Err("inconsistent first chunk");
        }
        if header.is_last() != (header.next == 0) {
            return Err("inconsistent chunk link");
        }
        if !header.is_last() && header.next < offset + header.extent() {
            return Err("chunk link points backwards");
        }
        Ok(header)
    }
}

/// Checksum of a chunk's id bytes and used payload
#[must_use]
pub fn body_crc(seed: u32, id: &[u8], payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c_append(seed, id), payload)
}

/// Bytes a chunk occupies given its id length and payload capacity
#[must_use]
pub const fn chunk_extent(id_len: usize, capacity: u32) -> u64 {
    CHUNK_HEADER_SIZE as u64 + id_len as u64 + capacity as u64
}

/// Append one encoded chunk to `buf`: header, id, payload, zero padding
/// up to `header.capacity`. Both checksums are computed here.
pub fn encode_chunk(buf: &mut BytesMut, seed: u32, header: &ChunkHeader, id: &[u8], payload: &[u8]) {
    let mut header = *header;
    header.body_crc = body_crc(seed, id, payload);
    buf.put_slice(&header.encode(seed));
    buf.put_slice(id);
    buf.put_slice(payload);
    buf.put_bytes(0, (header.capacity - header.length) as usize);
}

/// Stamp for `len` bytes reserved at `offset` (`len` covers at least a
/// chunk header)
#[must_use]
pub fn reservation_marker(offset: u64, len: u64, seed: u32) -> [u8; CHUNK_HEADER_SIZE] {
    ChunkHeader {
        flags: FLAG_RESERVED,
        id_len: 0,
        entry: offset,
        sequence: 0,
        capacity: 0,
        length: 0,
        next: offset + len,
        originator: 0,
        body_crc: 0,
    }
    .encode(seed)
}

/// Chunk capacities: entry chunk `n` gets `sizes[n]`, and the last size
/// repeats for every chunk after the schedule runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSchedule {
    sizes: Vec<u32>,
}

impl ChunkSchedule {
    pub fn new(sizes: Vec<u32>) -> Result<Self> {
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(Error::configuration("chunk schedule needs non-zero sizes"));
        }
        if sizes.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::configuration("chunk schedule must be non-decreasing"));
        }
        Ok(Self { sizes })
    }

    /// Capacity of chunk number `sequence`
    #[must_use]
    pub fn capacity(&self, sequence: u32) -> u32 {
        let last = self.sizes.len() - 1;
        self.sizes[(sequence as usize).min(last)]
    }

    /// Capacities for an entry of known size. The last chunk is trimmed
    /// to what remains; an empty entry is a single empty chunk.
    #[must_use]
    pub fn plan(&self, total: usize) -> Vec<u32> {
        let mut plan = Vec::new();
        let mut remaining = total;
        let mut sequence = 0;
        loop {
            let capacity = self.capacity(sequence) as usize;
            if remaining <= capacity {
                // fits in u32 because capacity does
                plan.push(u32::try_from(remaining).unwrap_or(u32::MAX));
                return plan;
            }
            plan.push(self.capacity(sequence));
            remaining -= capacity;
            sequence += 1;
        }
    }
}

impl Default for ChunkSchedule {
    fn default() -> Self {
        Self {
            sizes: filestore_common::config::JournalConfig::default().chunk_schedule,
        }
    }
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_last(offset: u64, id: &[u8], len: u32) -> ChunkHeader {
        ChunkHeader {
            flags: FLAG_FIRST | FLAG_LAST,
            id_len: u16::try_from(id.len()).unwrap(),
            entry: offset,
            sequence: 0,
            capacity: len,
            length: len,
            next: 0,
            originator: -7,
            body_crc: 0,
        }
    }

    #[test]
    fn test_file_header() {
        let xid = Xid::new(0xABCD, 42);
        let bytes = FileHeader::new(xid).to_bytes();
        assert_eq!(&bytes[0..4], b"HJSF");
        assert_eq!(FileHeader::from_bytes(&bytes).unwrap().xid, xid);

        let mut bad = bytes;
        bad[20] ^= 1;
        assert_eq!(FileHeader::from_bytes(&bad), Err("journal header checksum mismatch"));
    }

    #[test]
    fn test_chunk_encoding() {
        let seed = xid_seed(&Xid::new(1, 1));
        let id = b"/a/b";
        let header = first_last(48, id, 5);
        let mut buf = BytesMut::new();
        encode_chunk(&mut buf, seed, &header, id, b"hello");
        assert_eq!(buf.len() as u64, header.extent());

        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        raw.copy_from_slice(&buf[..CHUNK_HEADER_SIZE]);
        let parsed = ChunkHeader::from_bytes(&raw, 48, seed).unwrap();
        assert_eq!(parsed.originator, -7);
        assert_eq!(body_crc(seed, id, b"hello"), parsed.body_crc);

        // another transaction's seed does not verify
        let other = xid_seed(&Xid::new(1, 2));
        assert_eq!(
            ChunkHeader::from_bytes(&raw, 48, other),
            Err("chunk header checksum mismatch")
        );
    }

    #[test]
    fn test_header_fields_are_checksummed() {
        let header = first_last(48, b"/a/b", 0);
        let mut buf = BytesMut::new();
        encode_chunk(&mut buf, 0, &header, b"/a/b", b"");
        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        raw.copy_from_slice(&buf[..CHUNK_HEADER_SIZE]);

        // entry offset must equal the chunk offset on a first chunk
        assert!(ChunkHeader::from_bytes(&raw, 96, 0).is_err());
        assert!(ChunkHeader::from_bytes(&[0u8; CHUNK_HEADER_SIZE], 48, 0).is_err());

        // a flipped capacity byte is caught before the size is used
        raw[23] ^= 0x7F;
        assert_eq!(
            ChunkHeader::from_bytes(&raw, 48, 0),
            Err("chunk header checksum mismatch")
        );
    }

    #[test]
    fn test_reservation_marker() {
        let seed = xid_seed(&Xid::new(3, 4));
        let raw = reservation_marker(100, 400, seed);
        let parsed = ChunkHeader::from_bytes(&raw, 100, seed).unwrap();
        assert!(parsed.is_reserved());
        assert!(!parsed.is_first());
        assert_eq!(parsed.extent(), 400);
        assert_eq!(parsed.next, 500);
        assert!(ChunkHeader::from_bytes(&raw, 148, seed).is_err());
    }

    #[test]
    fn test_schedule_plan() {
        let schedule = ChunkSchedule::new(vec![8, 16, 32]).unwrap();
        assert_eq!(schedule.plan(0), vec![0]);
        assert_eq!(schedule.plan(8), vec![8]);
        assert_eq!(schedule.plan(9), vec![8, 1]);
        assert_eq!(schedule.plan(56), vec![8, 16, 32]);
        assert_eq!(schedule.plan(100), vec![8, 16, 32, 32, 12]);
        assert_eq!(schedule.capacity(10), 32);

        assert!(ChunkSchedule::new(vec![]).is_err());
        assert!(ChunkSchedule::new(vec![16, 8]).is_err());
        assert!(ChunkSchedule::new(vec![0, 8]).is_err());
    }
}
