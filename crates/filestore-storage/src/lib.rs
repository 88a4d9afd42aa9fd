//! File store storage engine
//!
//! This crate implements the durable side of the file store:
//! - Random-access I/O handles (files, memory, borrowed handles)
//! - Per-transaction journals with serial, concurrent and mmap writers
//! - The storage layout (namespaces, hash buckets, pruning walk)
//! - Admission control (permits, per-FsId locks, client slots)
//! - Record handle cache
//! - Transaction ledger and startup recovery
//! - The transactional [`FileStore`] client API

pub mod admission;
pub mod cache;
pub mod journal;
pub mod layout;
pub mod ledger;
pub mod raw_io;
pub mod recovery;
pub mod store;

// Re-exports
pub use admission::{ClientLimiter, LockTable, Operation, Permit, PermitPool};
pub use cache::{CacheStats, RecordCache, RecordHandle};
pub use journal::{
    ChunkSchedule, JournalEntry, JournalOutputStream, JournalStreamReader, JournalWriter,
    RandomAccessJournalReader, read_journal_xid,
};
pub use layout::{DirHash, StorageLayout};
pub use ledger::{FileTransactionLedger, TransactionLedger, TxState};
pub use raw_io::{AccessMode, IgnoreClose, MemoryIo, RandomAccessFile, RandomAccessIo};
pub use recovery::{RecoveryAction, RecoveryStatus, recover, replay_journal};
pub use store::{ClientSession, FileStore, StoreOutputStream};
