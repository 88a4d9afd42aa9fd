//! Transactional client API
//!
//! ```text
//!  begin --> write / open_output_stream --> commit --> storage layout
//!              |  (journal per data type)     |
//!              +--> read (own pending writes) +--> ledger C, apply, ledger D
//! ```
//!
//! Every mutation goes to the transaction's journal first. Commit seals the
//! journals, records the decision in the ledger, and applies the entries
//! with write-to-temp-then-rename. Rollback deletes the journals. Writes
//! take a per-FsId lock held until the transaction ends, and every
//! operation holds read or write permits while it runs.

use crate::admission::{ClientLimiter, ClientSlot, LockTable, Operation, Permit, PermitPool};
use crate::cache::{CacheStats, RecordCache, RecordHandle};
use crate::journal::{JournalOutputStream, JournalWriter, RandomAccessJournalReader};
use crate::layout::StorageLayout;
use crate::ledger::{FileTransactionLedger, TransactionLedger};
use crate::raw_io::{AccessMode, IgnoreClose, RandomAccessFile, RandomAccessIo};
use crate::recovery::{RecoveryStatus, recover, replay_journal};
use bytes::Bytes;
use filestore_common::{Config, DataType, Error, FsId, Result, Xid};
use filestore_query::Matcher;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, btree_set};
use std::fs;
use std::io::{ErrorKind, Write};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where an item's latest uncommitted value sits in its journal
#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    offset: u64,
    /// Offset of the entry's last chunk; replay applies entries in this order
    last_chunk: u64,
}

/// In-memory state of an open transaction
#[derive(Debug)]
struct Transaction {
    xid: Xid,
    journals: Mutex<HashMap<DataType, Arc<JournalWriter>>>,
    pending: Mutex<HashMap<(DataType, FsId), PendingEntry>>,
}

impl Transaction {
    fn new(xid: Xid) -> Self {
        Self {
            xid,
            journals: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Note a finished entry unless one that replays later is already noted
    fn record(&self, data_type: DataType, id: FsId, entry: PendingEntry) {
        match self.pending.lock().entry((data_type, id)) {
            Entry::Occupied(mut slot) => {
                if slot.get().last_chunk <= entry.last_chunk {
                    slot.insert(entry);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    fn pending_offset(&self, data_type: DataType, id: &FsId) -> Option<u64> {
        self.pending
            .lock()
            .get(&(data_type, id.clone()))
            .map(|entry| entry.offset)
    }

    fn open_streams(&self) -> usize {
        self.journals.lock().values().map(|w| w.open_streams()).sum()
    }

    fn take_journals(&self) -> Vec<(DataType, Arc<JournalWriter>)> {
        let mut journals: Vec<_> = self.journals.lock().drain().collect();
        journals.sort_by_key(|(data_type, _)| *data_type);
        journals
    }
}

/// The file store
pub struct FileStore {
    config: Config,
    layout: StorageLayout,
    ledger: Arc<dyn TransactionLedger>,
    permits: PermitPool,
    locks: LockTable,
    clients: ClientLimiter,
    cache: RecordCache,
    transactions: RwLock<HashMap<Xid, Arc<Transaction>>>,
    recovered: Vec<RecoveryStatus>,
}

impl FileStore {
    /// Open the store under `config.storage.data_dir`, recovering any
    /// transactions a previous process left behind
    pub fn open(config: Config) -> Result<Self> {
        let layout = StorageLayout::new(&config.storage);
        layout.create_dirs()?;
        let ledger = Arc::new(FileTransactionLedger::open(layout.xlog_dir())?);
        Self::with_ledger(config, ledger)
    }

    /// Open the store with an externally managed ledger
    pub fn with_ledger(config: Config, ledger: Arc<dyn TransactionLedger>) -> Result<Self> {
        config.validate()?;
        let layout = StorageLayout::new(&config.storage);
        layout.create_dirs()?;
        let recovered = recover(&layout, ledger.as_ref(), &config.journal)?;
        info!(
            data_dir = %layout.root().display(),
            writer = ?config.journal.writer,
            recovered = recovered.len(),
            "file store opened"
        );
        Ok(Self {
            permits: PermitPool::new(&config.throttle),
            locks: LockTable::new(config.throttle.lock_timeout()),
            clients: ClientLimiter::new(&config.server, config.throttle.lock_timeout()),
            cache: RecordCache::new(config.cache.metadata_entries),
            transactions: RwLock::new(HashMap::new()),
            config,
            layout,
            ledger,
            recovered,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// What recovery did when the store was opened
    #[must_use]
    pub fn recovery_report(&self) -> &[RecoveryStatus] {
        &self.recovered
    }

    #[must_use]
    pub const fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub const fn permits(&self) -> &PermitPool {
        &self.permits
    }

    #[must_use]
    pub const fn locks(&self) -> &LockTable {
        &self.locks
    }

    #[must_use]
    pub fn active_transactions(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self.transactions.read().keys().copied().collect();
        xids.sort();
        xids
    }

    /// Admit a client; its open transactions roll back when the session drops
    pub fn session(&self) -> Result<ClientSession<'_>> {
        let slot = self.clients.admit()?;
        Ok(ClientSession {
            store: self,
            _slot: slot,
            open: HashSet::new(),
        })
    }

    pub fn begin_transaction(&self) -> Result<Xid> {
        let xid = Xid::generate();
        self.ledger.begin(xid)?;
        self.transactions
            .write()
            .insert(xid, Arc::new(Transaction::new(xid)));
        debug!(%xid, "transaction begun");
        Ok(xid)
    }

    fn transaction(&self, xid: Xid) -> Result<Arc<Transaction>> {
        self.transactions
            .read()
            .get(&xid)
            .cloned()
            .ok_or(Error::TransactionNotFound(xid))
    }

    fn journal(&self, tx: &Transaction, data_type: DataType) -> Result<Arc<JournalWriter>> {
        let mut journals = tx.journals.lock();
        if let Some(writer) = journals.get(&data_type) {
            return Ok(Arc::clone(writer));
        }
        let path = self.layout.journal_path(tx.xid, data_type);
        let writer = Arc::new(JournalWriter::create(path, tx.xid, &self.config.journal)?);
        journals.insert(data_type, Arc::clone(&writer));
        Ok(writer)
    }

    /// Write a blob; returns the journal offset of the entry
    pub fn write(&self, xid: Xid, id: &FsId, originator: i64, data: &[u8]) -> Result<u64> {
        self.write_as(xid, DataType::Blob, id, originator, data)
    }

    pub fn write_as(
        &self,
        xid: Xid,
        data_type: DataType,
        id: &FsId,
        originator: i64,
        data: &[u8],
    ) -> Result<u64> {
        let _permit = self.permits.acquire(Operation::Write)?;
        let tx = self.transaction(xid)?;
        self.locks.lock(xid, id)?;
        let offset = self.journal(&tx, data_type)?.write(id, originator, data)?;
        // chunks of a known-size entry are contiguous, so its offset orders it
        tx.record(
            data_type,
            id.clone(),
            PendingEntry {
                offset,
                last_chunk: offset,
            },
        );
        Ok(offset)
    }

    /// Stream an item of unknown size. Write permits are held until the
    /// stream is closed.
    pub fn open_output_stream(
        &self,
        xid: Xid,
        data_type: DataType,
        id: &FsId,
        originator: i64,
    ) -> Result<StoreOutputStream<'_>> {
        let permit = self.permits.acquire(Operation::Write)?;
        let tx = self.transaction(xid)?;
        self.locks.lock(xid, id)?;
        let inner = self.journal(&tx, data_type)?.output_stream_owned(id, originator)?;
        Ok(StoreOutputStream {
            inner,
            tx,
            data_type,
            recorded: false,
            _permit: permit,
        })
    }

    /// Read an item. Inside a transaction its own uncommitted writes are
    /// visible; otherwise only committed data is.
    pub fn read(&self, xid: Option<Xid>, data_type: DataType, id: &FsId) -> Result<Bytes> {
        let _permit = self.permits.acquire(Operation::Read)?;
        if let Some(xid) = xid {
            let tx = self.transaction(xid)?;
            if let Some(offset) = tx.pending_offset(data_type, id) {
                return self.read_pending(xid, data_type, offset);
            }
        }
        self.read_committed(data_type, id)
    }

    fn read_pending(&self, xid: Xid, data_type: DataType, offset: u64) -> Result<Bytes> {
        let path = self.layout.journal_path(xid, data_type);
        let mut file = RandomAccessFile::open(&path, AccessMode::Read)?;
        let entry =
            RandomAccessJournalReader::new(IgnoreClose::new(&mut file), &path, xid)?.read(offset)?;
        file.close()?;
        Ok(entry.data)
    }

    fn read_committed(&self, data_type: DataType, id: &FsId) -> Result<Bytes> {
        let path = match self.cache.get(data_type, id) {
            Some(handle) => handle.path,
            None => self.layout.file_path(data_type, id),
        };
        let mut file = match RandomAccessFile::open(&path, AccessMode::Read) {
            Ok(file) => file,
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                self.cache.invalidate(data_type, id);
                return Err(Error::NotFound(format!("{data_type} {id}")));
            }
            Err(e) => return Err(e),
        };
        let len = file.length()?;
        let mut data = vec![0u8; usize::try_from(len).map_err(|_| Error::storage("item too large"))?];
        file.read_fully_at(0, &mut data)?;
        file.close()?;
        self.cache
            .insert(data_type, id.clone(), RecordHandle { path, len });
        Ok(Bytes::from(data))
    }

    /// Committed ids matching `pattern`, in order
    pub fn find(&self, pattern: &str) -> Result<btree_set::IntoIter<FsId>> {
        let matcher = Matcher::compile(pattern)?;
        let _permit = self.permits.acquire(Operation::Read)?;
        Ok(self.layout.find(&matcher)?.into_iter())
    }

    /// Commit a transaction and return the number of entries applied.
    ///
    /// Fails with [`Error::TransactionActive`] while output streams are open.
    /// A permit timeout leaves the transaction open, so it can be retried
    /// or rolled back.
    pub fn commit(&self, xid: Xid) -> Result<usize> {
        let _permit = self.permits.acquire(Operation::Write)?;
        let tx = {
            let mut transactions = self.transactions.write();
            let tx = transactions
                .get(&xid)
                .ok_or(Error::TransactionNotFound(xid))?;
            if tx.open_streams() > 0 {
                return Err(Error::TransactionActive(xid));
            }
            transactions
                .remove(&xid)
                .ok_or(Error::TransactionNotFound(xid))?
        };
        let journals = tx.take_journals();

        if let Err(e) = self.seal(&journals).and_then(|()| self.ledger.commit(xid)) {
            warn!(%xid, "commit failed before the decision was recorded: {e}");
            self.discard(xid, &journals);
            return Err(e);
        }

        let applied = self.apply(xid, &journals);
        let entries = match applied {
            Ok(entries) => entries,
            Err(e) => {
                // committed in the ledger; recovery replays the journals
                error!(%xid, "applying committed transaction failed: {e}");
                self.locks.release_all(xid);
                return Err(e);
            }
        };
        remove_journals(&journals);
        let locks = self.locks.release_all(xid);
        self.ledger.done(xid)?;
        info!(%xid, entries, locks, "transaction committed");
        Ok(entries)
    }

    fn seal(&self, journals: &[(DataType, Arc<JournalWriter>)]) -> Result<()> {
        for (_, writer) in journals {
            if self.config.journal.fsync_on_commit {
                writer.sync()?;
            }
            writer.close()?;
        }
        Ok(())
    }

    fn apply(&self, xid: Xid, journals: &[(DataType, Arc<JournalWriter>)]) -> Result<usize> {
        let mut entries = 0;
        for (data_type, writer) in journals {
            entries += replay_journal(
                &self.layout,
                Some(&self.cache),
                writer.path(),
                xid,
                *data_type,
                self.config.journal.fsync_on_commit,
            )?;
        }
        Ok(entries)
    }

    /// Discard a transaction's journals and locks
    pub fn rollback(&self, xid: Xid) -> Result<()> {
        let tx = self
            .transactions
            .write()
            .remove(&xid)
            .ok_or(Error::TransactionNotFound(xid))?;
        let journals = tx.take_journals();
        self.discard(xid, &journals);
        info!(%xid, "transaction rolled back");
        Ok(())
    }

    fn discard(&self, xid: Xid, journals: &[(DataType, Arc<JournalWriter>)]) {
        remove_journals(journals);
        if let Err(e) = self.ledger.rollback(xid) {
            // an unrecorded rollback is redone by recovery once the journals age out
            warn!(%xid, "failed to record rollback: {e}");
        }
        self.locks.release_all(xid);
    }
}

/// Best-effort removal; open streams may still hold the writers
fn remove_journals(journals: &[(DataType, Arc<JournalWriter>)]) {
    for (_, writer) in journals {
        match fs::remove_file(writer.path()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %writer.path().display(), "failed to remove journal: {e}"),
        }
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        for xid in self.active_transactions() {
            if let Err(e) = self.rollback(xid) {
                warn!(%xid, "failed to roll back on shutdown: {e}");
            }
        }
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("data_dir", &self.layout.root())
            .field("transactions", &self.transactions.read().len())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Streaming write into a transaction
///
/// The entry becomes visible to the transaction's own reads once closed.
/// Dropping the stream closes it.
pub struct StoreOutputStream<'a> {
    inner: JournalOutputStream<Arc<JournalWriter>>,
    tx: Arc<Transaction>,
    data_type: DataType,
    recorded: bool,
    _permit: Permit<'a>,
}

impl StoreOutputStream<'_> {
    /// Journal offset of the entry, known from the moment it is opened
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.inner.offset()
    }

    #[must_use]
    pub const fn id(&self) -> &FsId {
        self.inner.id()
    }

    pub fn close(&mut self) -> Result<u64> {
        let offset = self.inner.close()?;
        if !self.recorded {
            self.recorded = true;
            self.tx.record(
                self.data_type,
                self.inner.id().clone(),
                PendingEntry {
                    offset,
                    last_chunk: self.inner.last_chunk_offset(),
                },
            );
        }
        Ok(offset)
    }
}

impl std::fmt::Debug for StoreOutputStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOutputStream")
            .field("xid", &self.tx.xid)
            .field("data_type", &self.data_type)
            .field("id", self.inner.id())
            .field("offset", &self.inner.offset())
            .finish_non_exhaustive()
    }
}

impl std::io::Write for StoreOutputStream<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Drop for StoreOutputStream<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            if let Err(e) = self.close() {
                warn!(id = %self.inner.id(), "failed to close output stream: {e}");
            }
        }
    }
}

/// One connected client
///
/// Holds a client slot for its lifetime. Transactions begun through the
/// session and still open when it is dropped are rolled back, which
/// releases their locks.
pub struct ClientSession<'a> {
    store: &'a FileStore,
    _slot: ClientSlot<'a>,
    open: HashSet<Xid>,
}

impl<'a> ClientSession<'a> {
    #[must_use]
    pub const fn store(&self) -> &'a FileStore {
        self.store
    }

    pub fn begin_transaction(&mut self) -> Result<Xid> {
        let xid = self.store.begin_transaction()?;
        self.open.insert(xid);
        Ok(xid)
    }

    pub fn write(
        &self,
        xid: Xid,
        data_type: DataType,
        id: &FsId,
        originator: i64,
        data: &[u8],
    ) -> Result<u64> {
        self.store.write_as(xid, data_type, id, originator, data)
    }

    pub fn read(&self, xid: Option<Xid>, data_type: DataType, id: &FsId) -> Result<Bytes> {
        self.store.read(xid, data_type, id)
    }

    pub fn commit(&mut self, xid: Xid) -> Result<usize> {
        let entries = self.store.commit(xid)?;
        self.open.remove(&xid);
        Ok(entries)
    }

    pub fn rollback(&mut self, xid: Xid) -> Result<()> {
        self.open.remove(&xid);
        self.store.rollback(xid)
    }
}

impl std::fmt::Debug for ClientSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl Drop for ClientSession<'_> {
    fn drop(&mut self) {
        if self.open.is_empty() {
            return;
        }
        info!(open = self.open.len(), "client disconnected, rolling back");
        for xid in self.open.drain() {
            match self.store.rollback(xid) {
                Ok(()) | Err(Error::TransactionNotFound(_)) => {}
                Err(e) => warn!(%xid, "failed to roll back: {e}"),
            }
        }
    }
}
