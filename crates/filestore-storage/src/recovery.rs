//! Startup recovery
//!
//! Journals left in the transaction log after a crash are grouped by the
//! transaction that wrote them. A journal's file name and header must name
//! the same transaction. What happens to each group depends on the ledger:
//!
//! | Ledger state          | Action                                   |
//! |-----------------------|------------------------------------------|
//! | committed             | replay into storage, delete, mark done   |
//! | done / rolled back    | delete leftovers                         |
//! | begun or unknown, old | roll back: delete, record rollback       |
//! | begun or unknown, new | leave alone, report in doubt             |
//!
//! "Old" means untouched for longer than the auto-rollback age. A journal
//! that is corrupt before its tail stops recovery with an error.

use crate::cache::{RecordCache, RecordHandle};
use crate::journal::{JournalStreamReader, read_journal_xid};
use crate::layout::StorageLayout;
use crate::ledger::{TransactionLedger, TxState};
use filestore_common::config::JournalConfig;
use filestore_common::{DataType, Error, Result, Xid};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// What recovery did with one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Committed; its entries were applied
    Replayed { entries: usize },
    /// Already finished; leftover journals removed
    Cleaned,
    /// Never committed and too old; discarded
    RolledBack,
    /// Never committed but recent; left for its owner
    InDoubt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStatus {
    pub xid: Xid,
    pub data_types: Vec<DataType>,
    pub action: RecoveryAction,
}

struct JournalFile {
    data_type: DataType,
    path: PathBuf,
    modified: SystemTime,
    header_ok: bool,
}

/// Replay one journal into storage and return the number of entries applied
pub fn replay_journal(
    layout: &StorageLayout,
    cache: Option<&RecordCache>,
    path: &Path,
    xid: Xid,
    data_type: DataType,
    durable: bool,
) -> Result<usize> {
    let mut applied = 0;
    for entry in JournalStreamReader::open(path, xid)? {
        let entry = entry?;
        let target = layout.prepare(data_type, &entry.id)?;
        let tmp = target.with_file_name(format!(".{}.{}.tmp", entry.id.name(), entry.offset));
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&entry.data)?;
            if durable {
                out.sync_data()?;
            }
        }
        fs::rename(&tmp, &target)?;
        if let Some(cache) = cache {
            cache.insert(
                data_type,
                entry.id.clone(),
                RecordHandle {
                    path: target,
                    len: entry.data.len() as u64,
                },
            );
        }
        applied += 1;
    }
    debug!(path = %path.display(), %xid, applied, "replayed journal");
    Ok(applied)
}

/// Recover the store's transaction log
pub fn recover(
    layout: &StorageLayout,
    ledger: &dyn TransactionLedger,
    config: &JournalConfig,
) -> Result<Vec<RecoveryStatus>> {
    recover_at(layout, ledger, config, SystemTime::now())
}

/// [`recover`] with an explicit notion of "now" for the age check
pub fn recover_at(
    layout: &StorageLayout,
    ledger: &dyn TransactionLedger,
    config: &JournalConfig,
    now: SystemTime,
) -> Result<Vec<RecoveryStatus>> {
    let mut groups = scan_xlog(layout)?;
    for xid in ledger.pending_commits() {
        groups.entry(xid).or_default();
    }
    info!(transactions = groups.len(), "starting recovery");

    let mut report = Vec::with_capacity(groups.len());
    for (xid, journals) in groups {
        let action = recover_one(layout, ledger, config, now, xid, &journals)?;
        report.push(RecoveryStatus {
            xid,
            data_types: journals.iter().map(|j| j.data_type).collect(),
            action,
        });
    }
    ledger.compact()?;

    let count = |f: fn(&RecoveryAction) -> bool| report.iter().filter(|s| f(&s.action)).count();
    info!(
        replayed = count(|a| matches!(a, RecoveryAction::Replayed { .. })),
        rolled_back = count(|a| *a == RecoveryAction::RolledBack),
        in_doubt = count(|a| *a == RecoveryAction::InDoubt),
        "recovery finished"
    );
    Ok(report)
}

fn recover_one(
    layout: &StorageLayout,
    ledger: &dyn TransactionLedger,
    config: &JournalConfig,
    now: SystemTime,
    xid: Xid,
    journals: &[JournalFile],
) -> Result<RecoveryAction> {
    match ledger.state(xid) {
        Some(TxState::Committed) => {
            let mut entries = 0;
            for journal in journals {
                if !journal.header_ok {
                    return Err(Error::Recovery(format!(
                        "committed transaction {xid} has an unreadable journal {}",
                        journal.path.display()
                    )));
                }
                entries += replay_journal(
                    layout,
                    None,
                    &journal.path,
                    xid,
                    journal.data_type,
                    config.fsync_on_commit,
                )
                .inspect_err(|e| error!(%xid, path = %journal.path.display(), "replay failed: {e}"))?;
            }
            remove_journals(journals)?;
            ledger.done(xid)?;
            info!(%xid, entries, "replayed committed transaction");
            Ok(if journals.is_empty() {
                RecoveryAction::Cleaned
            } else {
                RecoveryAction::Replayed { entries }
            })
        }
        Some(TxState::Done | TxState::RolledBack) => {
            remove_journals(journals)?;
            Ok(RecoveryAction::Cleaned)
        }
        Some(TxState::Active) | None => {
            let newest = journals
                .iter()
                .map(|j| j.modified)
                .max()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let age = now.duration_since(newest).unwrap_or(Duration::ZERO);
            if age >= config.auto_rollback() {
                remove_journals(journals)?;
                ledger.rollback(xid)?;
                warn!(%xid, age_secs = age.as_secs(), "rolled back abandoned transaction");
                Ok(RecoveryAction::RolledBack)
            } else {
                debug!(%xid, age_secs = age.as_secs(), "transaction in doubt");
                Ok(RecoveryAction::InDoubt)
            }
        }
    }
}

/// Group the journals in the transaction log by transaction
fn scan_xlog(layout: &StorageLayout) -> Result<BTreeMap<Xid, Vec<JournalFile>>> {
    let mut groups: BTreeMap<Xid, Vec<JournalFile>> = BTreeMap::new();
    let dir = layout.xlog_dir();
    if !dir.is_dir() {
        return Ok(groups);
    }
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some((xid, data_type)) = name.to_str().and_then(StorageLayout::parse_journal_name)
        else {
            continue;
        };
        let path = entry.path();
        let header_ok = match read_journal_xid(&path) {
            Ok(found) if found == xid => true,
            Ok(found) => {
                return Err(Error::Recovery(format!(
                    "{} is named for {xid} but declares {found}",
                    path.display()
                )));
            }
            Err(Error::Corruption { reason, .. }) => {
                warn!(path = %path.display(), "journal header unreadable: {reason}");
                false
            }
            Err(e) => return Err(e),
        };
        groups.entry(xid).or_default().push(JournalFile {
            data_type,
            modified: entry.metadata()?.modified()?,
            path,
            header_ok,
        });
    }
    for journals in groups.values_mut() {
        journals.sort_by_key(|j| j.data_type);
    }
    Ok(groups)
}

fn remove_journals(journals: &[JournalFile]) -> Result<()> {
    for journal in journals {
        match fs::remove_file(&journal.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalWriter;
    use crate::ledger::FileTransactionLedger;
    use filestore_common::FsId;
    use filestore_common::config::StorageConfig;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        layout: StorageLayout,
        ledger: FileTransactionLedger,
        config: JournalConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(&StorageConfig {
            data_dir: dir.path().to_path_buf(),
            max_files_per_dir: 16,
            max_files_per_store: 256,
        });
        layout.create_dirs().unwrap();
        let ledger = FileTransactionLedger::open(layout.xlog_dir()).unwrap();
        Fixture {
            _dir: dir,
            layout,
            ledger,
            config: JournalConfig {
                chunk_schedule: vec![16, 64],
                ..JournalConfig::default()
            },
        }
    }

    fn journal(fx: &Fixture, xid: Xid, data_type: DataType, items: &[(&str, &[u8])]) {
        let path = fx.layout.journal_path(xid, data_type);
        let writer = JournalWriter::create(&path, xid, &fx.config).unwrap();
        for (id, data) in items {
            writer.write(&FsId::parse(id).unwrap(), 0, data).unwrap();
        }
        writer.close().unwrap();
    }

    fn stored(fx: &Fixture, data_type: DataType, id: &str) -> Option<Vec<u8>> {
        fs::read(fx.layout.file_path(data_type, &FsId::parse(id).unwrap())).ok()
    }

    fn status(report: &[RecoveryStatus], xid: Xid) -> RecoveryAction {
        report.iter().find(|s| s.xid == xid).unwrap().action
    }

    #[test]
    fn test_committed_transactions_are_replayed() {
        let fx = fixture();
        let xid = Xid::new(1, 0);
        fx.ledger.begin(xid).unwrap();
        journal(&fx, xid, DataType::Blob, &[("/a/b/1", b"first"), ("/a/b/1", b"second")]);
        journal(&fx, xid, DataType::TimeSeries, &[("/ts/x", &[7u8; 100])]);
        fx.ledger.commit(xid).unwrap();

        let report = recover(&fx.layout, &fx.ledger, &fx.config).unwrap();
        assert_eq!(status(&report, xid), RecoveryAction::Replayed { entries: 3 });
        assert_eq!(report[0].data_types, vec![DataType::Blob, DataType::TimeSeries]);
        assert_eq!(stored(&fx, DataType::Blob, "/a/b/1").unwrap(), b"second");
        assert_eq!(stored(&fx, DataType::TimeSeries, "/ts/x").unwrap(), vec![7u8; 100]);
        assert!(!fx.layout.journal_path(xid, DataType::Blob).exists());
        assert_eq!(fx.ledger.state(xid), None);
    }

    #[test]
    fn test_uncommitted_age_decides() {
        let fx = fixture();
        let (fresh, stale) = (Xid::new(2, 0), Xid::new(3, 0));
        for xid in [fresh, stale] {
            fx.ledger.begin(xid).unwrap();
            journal(&fx, xid, DataType::Blob, &[("/a/b/2", b"never")]);
        }
        let stale_path = fx.layout.journal_path(stale, DataType::Blob);
        let old = SystemTime::now() - fx.config.auto_rollback() - Duration::from_secs(60);
        File::options()
            .write(true)
            .open(&stale_path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let report = recover(&fx.layout, &fx.ledger, &fx.config).unwrap();
        assert_eq!(status(&report, fresh), RecoveryAction::InDoubt);
        assert_eq!(status(&report, stale), RecoveryAction::RolledBack);
        assert!(fx.layout.journal_path(fresh, DataType::Blob).exists());
        assert!(!stale_path.exists());
        assert!(stored(&fx, DataType::Blob, "/a/b/2").is_none());
    }

    #[test]
    fn test_finished_transactions_are_cleaned() {
        let fx = fixture();
        let (done, gone, lost) = (Xid::new(4, 0), Xid::new(5, 0), Xid::new(6, 0));
        journal(&fx, done, DataType::Blob, &[("/a/b/3", b"x")]);
        fx.ledger.commit(done).unwrap();
        fx.ledger.done(done).unwrap();
        journal(&fx, gone, DataType::Blob, &[("/a/b/4", b"y")]);
        fx.ledger.rollback(gone).unwrap();
        fx.ledger.commit(lost).unwrap();

        let report = recover(&fx.layout, &fx.ledger, &fx.config).unwrap();
        assert_eq!(status(&report, done), RecoveryAction::Cleaned);
        assert_eq!(status(&report, gone), RecoveryAction::Cleaned);
        assert_eq!(status(&report, lost), RecoveryAction::Cleaned);
        assert!(stored(&fx, DataType::Blob, "/a/b/3").is_none());
        assert!(fx.ledger.pending_commits().is_empty());
    }

    #[test]
    fn test_misnamed_journal_stops_recovery() {
        let fx = fixture();
        let (a, b) = (Xid::new(7, 0), Xid::new(8, 0));
        journal(&fx, a, DataType::Blob, &[("/a/b/5", b"z")]);
        fs::rename(
            fx.layout.journal_path(a, DataType::Blob),
            fx.layout.journal_path(b, DataType::Blob),
        )
        .unwrap();
        assert!(matches!(
            recover(&fx.layout, &fx.ledger, &fx.config),
            Err(Error::Recovery(_))
        ));
    }

    #[test]
    fn test_corrupt_committed_journal_is_fatal() {
        let fx = fixture();
        let xid = Xid::new(9, 0);
        journal(&fx, xid, DataType::Blob, &[("/a/b/6", &[1u8; 40]), ("/a/b/7", b"tail")]);
        fx.ledger.commit(xid).unwrap();
        let path = fx.layout.journal_path(xid, DataType::Blob);
        let mut bytes = fs::read(&path).unwrap();
        // inside the first entry's payload
        bytes[48 + crate::journal::format::CHUNK_HEADER_SIZE + 6 + 3] ^= 0x55;
        fs::write(&path, bytes).unwrap();

        let err = recover(&fx.layout, &fx.ledger, &fx.config).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(fx.ledger.state(xid), Some(TxState::Committed));
        assert!(path.exists());
    }

    #[test]
    fn test_torn_header_of_uncommitted_journal() {
        let fx = fixture();
        let xid = Xid::new(10, 0);
        let path = fx.layout.journal_path(xid, DataType::MjdTimeSeries);
        fs::write(&path, b"FSJ").unwrap();
        let later = SystemTime::now() + fx.config.auto_rollback();

        let report = recover_at(&fx.layout, &fx.ledger, &fx.config, later).unwrap();
        assert_eq!(status(&report, xid), RecoveryAction::RolledBack);
        assert!(!path.exists());
    }
}
