//! Append-only backup log using sled
//!
//! Three trees hold the same rows under different keys so each query is a
//! single prefix scan:
//!
//! ```text
//! entries:  <path> \0 <run_name>               -> StoredEntry
//! runs:     <run_name> \0 <path>               -> ()
//! refs:     <checksum> \0 <path> \0 <run_name> -> ()
//! ```

use crate::{Error, Result};
use abus_core::run_name::validate_timestamp;
use abus_core::{Checksum, RunIndexEntry, RunName};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::collections::{BTreeMap, BTreeSet};

pub(crate) const ENTRIES_TREE: &str = "entries";
pub(crate) const RUNS_TREE: &str = "runs";
pub(crate) const REFS_TREE: &str = "refs";

const SEP: u8 = 0;

/// One row of the log
#[derive(Debug, Clone, PartialEq)]
pub struct BackupEntry {
    pub run_name: RunName,
    pub path: String,
    pub timestamp: f64,
    pub checksum: Checksum,
}

impl From<BackupEntry> for RunIndexEntry {
    fn from(row: BackupEntry) -> Self {
        RunIndexEntry {
            path: row.path,
            timestamp: row.timestamp,
            checksum: row.checksum,
        }
    }
}

/// One version of a single path
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub run_name: RunName,
    pub timestamp: f64,
    pub checksum: Checksum,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    timestamp: f64,
    checksum: Checksum,
}

/// Durable `(run, path, timestamp, checksum)` log
pub struct BackupLog {
    db: Db,
    entries: Tree,
    runs: Tree,
    refs: Tree,
    /// In-memory index: path -> latest run name
    latest: RwLock<BTreeMap<String, RunName>>,
}

impl BackupLog {
    /// Open the log inside the catalog database
    pub fn open(db: &Db) -> Result<Self> {
        let entries = db.open_tree(ENTRIES_TREE)?;
        let runs = db.open_tree(RUNS_TREE)?;
        let refs = db.open_tree(REFS_TREE)?;

        // Keys sort by path then run name, so the last row seen per path wins
        let mut latest = BTreeMap::new();
        for item in entries.iter() {
            let (key, _) = item?;
            let (path, run_name) = split_entry_key(&key)?;
            latest.insert(path, run_name);
        }

        Ok(Self {
            db: db.clone(),
            entries,
            runs,
            refs,
            latest: RwLock::new(latest),
        })
    }

    /// Record one backed-up version
    ///
    /// A row already present for `(run_name, path)` is replaced. The blob for
    /// `checksum` must already be registered by the caller.
    pub fn add_entry(
        &self,
        run_name: &RunName,
        path: &str,
        timestamp: f64,
        checksum: &Checksum,
    ) -> Result<()> {
        validate_timestamp(timestamp)?;
        validate_path(path)?;

        let entry_id = entry_key(path, run_name);
        let run_id = run_key(run_name, path);
        let ref_id = ref_key(checksum, path, run_name);
        let value = bincode::serialize(&StoredEntry {
            timestamp,
            checksum: *checksum,
        })?;

        (&self.entries, &self.runs, &self.refs)
            .transaction(|(entries, runs, refs)| {
                if let Some(old) = entries.get(entry_id.as_slice())? {
                    let old: StoredEntry =
                        bincode::deserialize(&old).map_err(ConflictableTransactionError::Abort)?;
                    refs.remove(ref_key(&old.checksum, path, run_name))?;
                }
                entries.insert(entry_id.as_slice(), value.as_slice())?;
                runs.insert(run_id.as_slice(), Vec::<u8>::new())?;
                refs.insert(ref_id.as_slice(), Vec::<u8>::new())?;
                Ok(())
            })
            .map_err(map_tx_err)?;

        let mut latest = self.latest.write();
        match latest.get(path) {
            Some(current) if current >= run_name => {}
            _ => {
                latest.insert(path.to_string(), run_name.clone());
            }
        }

        Ok(())
    }

    /// All versions of a path, ascending by run name
    pub fn history_for_path(&self, path: &str) -> Result<Vec<HistoryEntry>> {
        let mut prefix = path.as_bytes().to_vec();
        prefix.push(SEP);

        let mut history = Vec::new();
        for item in self.entries.scan_prefix(&prefix) {
            let (key, value) = item?;
            let (_, run_name) = split_entry_key(&key)?;
            let stored: StoredEntry = bincode::deserialize(&value)?;
            history.push(HistoryEntry {
                run_name,
                timestamp: stored.timestamp,
                checksum: stored.checksum,
            });
        }
        Ok(history)
    }

    /// Latest run name recorded for a path
    pub fn latest_for_path(&self, path: &str) -> Option<RunName> {
        self.latest.read().get(path).cloned()
    }

    /// Distinct paths ever seen (and not fully purged)
    pub fn all_paths(&self) -> BTreeSet<String> {
        self.latest.read().keys().cloned().collect()
    }

    /// Remove exactly the given rows of one path
    ///
    /// Refuses the whole request, deleting nothing, if it names the path's
    /// latest run. Unknown run names are skipped. Returns the number of rows
    /// removed.
    pub fn delete_entries(&self, path: &str, run_names: &BTreeSet<RunName>) -> Result<usize> {
        if let Some(latest) = self.latest_for_path(path) {
            if run_names.contains(&latest) {
                return Err(Error::ProtectedEntryDeletion {
                    path: path.to_string(),
                    run_name: latest.to_string(),
                });
            }
        }

        let removed = (&self.entries, &self.runs, &self.refs)
            .transaction(|(entries, runs, refs)| {
                let mut removed = 0usize;
                for run_name in run_names {
                    let Some(old) = entries.remove(entry_key(path, run_name))? else {
                        continue;
                    };
                    let old: StoredEntry =
                        bincode::deserialize(&old).map_err(ConflictableTransactionError::Abort)?;
                    runs.remove(run_key(run_name, path))?;
                    refs.remove(ref_key(&old.checksum, path, run_name))?;
                    removed += 1;
                }
                Ok(removed)
            })
            .map_err(map_tx_err)?;

        self.db.flush()?;
        Ok(removed)
    }

    /// All rows written by one run
    pub fn entries_for_run(&self, run_name: &RunName) -> Result<Vec<BackupEntry>> {
        let mut prefix = run_name.as_str().as_bytes().to_vec();
        prefix.push(SEP);

        let mut rows = Vec::new();
        for item in self.runs.scan_prefix(&prefix) {
            let (key, _) = item?;
            let path = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|_| Error::Corrupt("non-UTF-8 path in run index".to_string()))?;
            let value = self.entries.get(entry_key(&path, run_name))?.ok_or_else(|| {
                Error::Corrupt(format!("run {run_name} lists {path} without an entry"))
            })?;
            let stored: StoredEntry = bincode::deserialize(&value)?;
            rows.push(BackupEntry {
                run_name: run_name.clone(),
                path,
                timestamp: stored.timestamp,
                checksum: stored.checksum,
            });
        }
        Ok(rows)
    }

    /// Distinct run names with at least one surviving row
    pub fn all_runs(&self) -> Result<BTreeSet<RunName>> {
        let mut runs = BTreeSet::new();
        for item in self.runs.iter() {
            let (key, _) = item?;
            let end = key.iter().position(|&b| b == SEP).unwrap_or(key.len());
            let name = std::str::from_utf8(&key[..end])
                .map_err(|_| Error::Corrupt("non-UTF-8 run name".to_string()))?;
            runs.insert(RunName::parse(name)?);
        }
        Ok(runs)
    }

    /// Number of rows referencing a checksum
    pub fn reference_count(&self, checksum: &Checksum) -> Result<usize> {
        count_refs(&self.refs, checksum)
    }

    /// Every path's full history, read in one pass
    pub fn snapshot(&self) -> Result<BTreeMap<String, Vec<HistoryEntry>>> {
        let mut histories: BTreeMap<String, Vec<HistoryEntry>> = BTreeMap::new();
        for item in self.entries.iter() {
            let (key, value) = item?;
            let (path, run_name) = split_entry_key(&key)?;
            let stored: StoredEntry = bincode::deserialize(&value)?;
            histories.entry(path).or_default().push(HistoryEntry {
                run_name,
                timestamp: stored.timestamp,
                checksum: stored.checksum,
            });
        }
        Ok(histories)
    }

    /// Total number of rows
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub(crate) fn count_refs(refs: &Tree, checksum: &Checksum) -> Result<usize> {
    let mut prefix = checksum.to_string().into_bytes();
    prefix.push(SEP);

    let mut count = 0;
    for item in refs.scan_prefix(&prefix) {
        item?;
        count += 1;
    }
    Ok(count)
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.as_bytes().contains(&SEP) {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn entry_key(path: &str, run_name: &RunName) -> Vec<u8> {
    join_key(&[path, run_name.as_str()])
}

fn run_key(run_name: &RunName, path: &str) -> Vec<u8> {
    join_key(&[run_name.as_str(), path])
}

fn ref_key(checksum: &Checksum, path: &str, run_name: &RunName) -> Vec<u8> {
    join_key(&[&checksum.to_string(), path, run_name.as_str()])
}

fn join_key(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEP);
        }
        key.extend_from_slice(part.as_bytes());
    }
    key
}

fn split_entry_key(key: &[u8]) -> Result<(String, RunName)> {
    let corrupt = || Error::Corrupt(format!("malformed entry key {:?}", String::from_utf8_lossy(key)));
    let pos = key.iter().rposition(|&b| b == SEP).ok_or_else(corrupt)?;
    let path = std::str::from_utf8(&key[..pos]).map_err(|_| corrupt())?;
    let run = std::str::from_utf8(&key[pos + 1..]).map_err(|_| corrupt())?;
    Ok((path.to_string(), RunName::parse(run)?))
}

fn map_tx_err(err: TransactionError<bincode::Error>) -> Error {
    match err {
        TransactionError::Abort(e) => Error::Serialization(e),
        TransactionError::Storage(e) => Error::Database(e),
    }
}
