//! Transaction ledger
//!
//! The ledger is the source of truth for whether a transaction committed.
//! [`FileTransactionLedger`] keeps it as an append-only text file in the
//! transaction log directory, one line per state change:
//!
//! ```text
//! B <xid>    begun
//! C <xid>    committed (synced before commit returns)
//! D <xid>    committed and applied to storage
//! R <xid>    rolled back
//! ```
//!
//! A crash can tear the last line; a line without its newline is dropped
//! when the ledger is opened. Any other unreadable line is corruption.

use filestore_common::{Error, Result, Xid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Ledger file name inside the transaction log directory
pub const LEDGER_FILE: &str = "ledger.log";

/// Last recorded state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Done,
    RolledBack,
}

impl TxState {
    const fn tag(self) -> char {
        match self {
            Self::Active => 'B',
            Self::Committed => 'C',
            Self::Done => 'D',
            Self::RolledBack => 'R',
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "B" => Some(Self::Active),
            "C" => Some(Self::Committed),
            "D" => Some(Self::Done),
            "R" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

/// Record of which transactions committed
pub trait TransactionLedger: Send + Sync {
    fn begin(&self, xid: Xid) -> Result<()>;

    /// Durably record the commit decision
    fn commit(&self, xid: Xid) -> Result<()>;

    /// Record that a committed transaction is fully applied
    fn done(&self, xid: Xid) -> Result<()>;

    fn rollback(&self, xid: Xid) -> Result<()>;

    fn state(&self, xid: Xid) -> Option<TxState>;

    /// Committed transactions not yet applied
    fn pending_commits(&self) -> Vec<Xid>;

    /// Forget finished transactions
    fn compact(&self) -> Result<()> {
        Ok(())
    }
}

struct LedgerInner {
    file: File,
    states: HashMap<Xid, TxState>,
}

/// Ledger kept in an append-only file
pub struct FileTransactionLedger {
    path: PathBuf,
    inner: Mutex<LedgerInner>,
}

impl FileTransactionLedger {
    /// Open the ledger in `dir`, creating it if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(LEDGER_FILE);
        let (states, valid_len) = Self::scan(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() > valid_len {
            warn!(path = %path.display(), valid_len, "dropping torn ledger line");
            file.set_len(valid_len)?;
        }
        debug!(path = %path.display(), transactions = states.len(), "opened ledger");
        Ok(Self {
            path,
            inner: Mutex::new(LedgerInner { file, states }),
        })
    }

    /// Replay the ledger, returning states and the length of whole lines
    fn scan(path: &Path) -> Result<(HashMap<Xid, TxState>, u64)> {
        let text = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((HashMap::new(), 0)),
            Err(e) => return Err(e.into()),
        };
        let mut states = HashMap::new();
        let mut pos = 0usize;
        while let Some(nl) = text[pos..].iter().position(|&b| b == b'\n') {
            let line = &text[pos..pos + nl];
            let (state, xid) = parse_line(line)
                .ok_or_else(|| Error::corruption(path, pos as u64, "unreadable ledger line"))?;
            states.insert(xid, state);
            pos += nl + 1;
        }
        Ok((states, pos as u64))
    }

    fn append(&self, xid: Xid, state: TxState, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let line = format!("{} {xid}\n", state.tag());
        inner.file.write_all(line.as_bytes())?;
        if sync {
            inner.file.sync_data()?;
        }
        inner.states.insert(xid, state);
        debug!(%xid, ?state, "ledger");
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_line(line: &[u8]) -> Option<(TxState, Xid)> {
    let line = std::str::from_utf8(line).ok()?;
    let (tag, xid) = line.split_once(' ')?;
    Some((TxState::from_tag(tag)?, xid.parse().ok()?))
}

impl TransactionLedger for FileTransactionLedger {
    fn begin(&self, xid: Xid) -> Result<()> {
        self.append(xid, TxState::Active, false)
    }

    fn commit(&self, xid: Xid) -> Result<()> {
        self.append(xid, TxState::Committed, true)
    }

    fn done(&self, xid: Xid) -> Result<()> {
        self.append(xid, TxState::Done, false)
    }

    fn rollback(&self, xid: Xid) -> Result<()> {
        self.append(xid, TxState::RolledBack, false)
    }

    fn state(&self, xid: Xid) -> Option<TxState> {
        self.inner.lock().states.get(&xid).copied()
    }

    fn pending_commits(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self
            .inner
            .lock()
            .states
            .iter()
            .filter(|(_, state)| **state == TxState::Committed)
            .map(|(xid, _)| *xid)
            .collect();
        xids.sort();
        xids
    }

    /// Rewrite the ledger with only active and committed transactions
    fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .states
            .retain(|_, state| matches!(state, TxState::Active | TxState::Committed));
        let mut live: Vec<(Xid, TxState)> = inner.states.iter().map(|(x, s)| (*x, *s)).collect();
        live.sort_by_key(|(xid, _)| *xid);

        let tmp = self.path.with_extension("log.new");
        {
            let mut out = File::create(&tmp)?;
            for (xid, state) in &live {
                writeln!(out, "{} {xid}", state.tag())?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        inner.file = OpenOptions::new().append(true).open(&self.path)?;
        debug!(path = %self.path.display(), live = live.len(), "compacted ledger");
        Ok(())
    }
}

impl std::fmt::Debug for FileTransactionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransactionLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
