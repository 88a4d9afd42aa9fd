//! Per-transaction journals
//!
//! Every mutation made inside a transaction is first appended to a journal
//! file stamped with the transaction's [`Xid`](filestore_common::Xid). On
//! commit the journal is replayed into the storage layout; on rollback it
//! is deleted. See [`format`] for the byte layout.
//!
//! Writers ([`JournalWriter`], backend chosen by
//! [`WriterKind`](filestore_common::WriterKind)):
//! - serial: one lock around reservation and copy
//! - concurrent: offsets reserved under a lock, copies in parallel
//! - mmap: writes through a growable mapping (`mmap-journal` feature)
//!
//! Readers: [`JournalStreamReader`] for full scans (tolerates a torn tail)
//! and [`RandomAccessJournalReader`] for fetches by offset.

mod concurrent;
pub mod format;
#[cfg(feature = "mmap-journal")]
mod mapped;
pub mod reader;
mod serial;
pub mod writer;

#[cfg(test)]
mod conformance;

pub use format::ChunkSchedule;
pub use reader::{JournalEntry, JournalStreamReader, RandomAccessJournalReader, read_journal_xid};
pub use writer::{JournalOutputStream, JournalWriter};
