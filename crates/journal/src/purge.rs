//! Purge engine
//!
//! Applies one retention decision to the catalog and the archive:
//!
//! ```text
//! Idle -> Scanning -> Deciding -> Deleting -> Done
//! ```
//!
//! Every history is read before anything is deleted. Rows go first, then
//! the run-index files they were listed in, then the blobs nothing points at
//! any more. Archive failures on single blobs are counted and skipped; the
//! blob's metadata stays, so the next purge retries it. Blobs the index never
//! recorded are reclaimed too.

use crate::backup_log::{BackupLog, HistoryEntry};
use crate::checksum_index::ChecksumIndex;
use crate::retention::{get_purgeable_backups, PurgeSet, RetentionSchedule};
use crate::{Error, Result};
use abus_core::{Checksum, RunIndexEntry, RunName};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, error, info, warn};

/// Default size of the checksum deletion pool
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeState {
    Idle,
    Scanning,
    Deciding,
    Deleting,
    Done,
}

impl fmt::Display for PurgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PurgeState::Idle => "idle",
            PurgeState::Scanning => "scanning",
            PurgeState::Deciding => "deciding",
            PurgeState::Deleting => "deleting",
            PurgeState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Everything one purge at a given `now` would delete
#[derive(Debug, Clone, Default)]
pub struct PurgePlan {
    /// The retention decision
    pub retention: PurgeSet,
    /// Registered checksums no row references, left by earlier failed removals
    pub stranded: BTreeSet<Checksum>,
    /// Unreferenced blobs in the archive without a record
    pub orphans: BTreeSet<Checksum>,
}

impl PurgePlan {
    /// Every checksum the purge deletes
    pub fn checksums(&self) -> BTreeSet<Checksum> {
        self.retention
            .checksums
            .iter()
            .chain(&self.stranded)
            .chain(&self.orphans)
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.retention.is_empty() && self.stranded.is_empty() && self.orphans.is_empty()
    }
}

/// What one purge did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub entries_purged: usize,
    pub checksums_purged: usize,
    pub bytes_reclaimed: u64,
    pub runs_rewritten: usize,
    /// Items skipped because of storage errors
    pub failures: usize,
}

impl PurgeReport {
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

pub struct PurgeEngine<'a> {
    log: &'a BackupLog,
    index: &'a ChecksumIndex,
    schedule: RetentionSchedule,
    workers: usize,
    state: PurgeState,
}

impl<'a> PurgeEngine<'a> {
    pub fn new(log: &'a BackupLog, index: &'a ChecksumIndex, schedule: RetentionSchedule) -> Self {
        Self {
            log,
            index,
            schedule,
            workers: DEFAULT_WORKERS,
            state: PurgeState::Idle,
        }
    }

    /// Bound the checksum deletion pool
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::Configuration("purge workers must be at least 1".to_string()));
        }
        self.workers = workers;
        Ok(self)
    }

    pub fn state(&self) -> PurgeState {
        self.state
    }

    /// Compute what a purge at `now` would delete, without touching anything
    pub fn plan(&self, now: f64) -> Result<PurgePlan> {
        let histories = self.log.snapshot()?;
        self.decide(now, &histories)
    }

    /// Run one full purge at `now`
    ///
    /// Returns `Err` only for fatal conditions: the catalog or the archive's
    /// blob listing could not be read, a protected row or a still-referenced blob was about to be deleted, or
    /// the worker pool could not start. Everything else ends up in
    /// `PurgeReport::failures`.
    pub fn run_purge(&mut self, now: f64) -> Result<PurgeReport> {
        self.state = PurgeState::Idle;

        self.transition(PurgeState::Scanning);
        let histories = self.log.snapshot().inspect_err(|e| {
            error!(error = %e, "failed to read backup log");
        })?;
        info!(paths = histories.len(), rows = self.log.len(), "scanned backup log");

        self.transition(PurgeState::Deciding);
        let plan = self.decide(now, &histories)?;
        info!(
            entries = plan.retention.entries.len(),
            checksums = plan.retention.checksums.len(),
            stranded = plan.stranded.len(),
            orphans = plan.orphans.len(),
            kept = plan.retention.kept,
            protected = plan.retention.protected,
            "retention decided"
        );

        self.transition(PurgeState::Deleting);
        let mut report = PurgeReport::default();
        let touched_runs = self.delete_rows(&plan.retention, &mut report)?;
        self.rewrite_run_indexes(&touched_runs, &mut report);
        self.delete_checksums(&plan, &mut report)?;
        self.log.flush()?;

        self.transition(PurgeState::Done);
        info!(
            entries = report.entries_purged,
            checksums = report.checksums_purged,
            bytes = report.bytes_reclaimed,
            runs = report.runs_rewritten,
            failures = report.failures,
            "purge complete"
        );
        Ok(report)
    }

    fn transition(&mut self, next: PurgeState) {
        debug!(from = %self.state, to = %next, "purge state");
        self.state = next;
    }

    fn delete_rows(&self, plan: &PurgeSet, report: &mut PurgeReport) -> Result<BTreeSet<RunName>> {
        let mut touched = BTreeSet::new();

        for (path, runs) in plan.runs_by_path() {
            match self.log.delete_entries(path, &runs) {
                Ok(removed) => {
                    debug!(path, removed, "purged rows");
                    report.entries_purged += removed;
                    touched.extend(runs);
                }
                Err(e @ Error::ProtectedEntryDeletion { .. }) => {
                    error!(error = %e, "retention tried to purge a latest version");
                    return Err(e);
                }
                Err(e) => {
                    warn!(path, error = %e, "failed to purge rows");
                    report.failures += 1;
                }
            }
        }

        Ok(touched)
    }

    fn rewrite_run_indexes(&self, runs: &BTreeSet<RunName>, report: &mut PurgeReport) {
        let archive = self.index.archive();

        for run in runs {
            let rows = match self.log.entries_for_run(run) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(run = %run, error = %e, "failed to read run rows");
                    report.failures += 1;
                    continue;
                }
            };
            let index: Vec<RunIndexEntry> = rows
                .into_iter()
                .map(RunIndexEntry::from)
                .collect();

            match archive.write_run_index(run, &index) {
                Ok(()) => report.runs_rewritten += 1,
                Err(e) => {
                    warn!(run = %run, error = %e, "failed to rewrite run index");
                    report.failures += 1;
                }
            }
        }
    }

    fn decide(&self, now: f64, histories: &BTreeMap<String, Vec<HistoryEntry>>) -> Result<PurgePlan> {
        let retention = get_purgeable_backups(&self.schedule, now, histories)?;

        // Retention candidates still hold references until their rows go
        let mut stranded = BTreeSet::new();
        for checksum in self.index.checksums()? {
            if !retention.checksums.contains(&checksum) && self.log.reference_count(&checksum)? == 0 {
                stranded.insert(checksum);
            }
        }

        let mut orphans = BTreeSet::new();
        for checksum in self.index.orphans()? {
            if self.log.reference_count(&checksum)? == 0 {
                orphans.insert(checksum);
            }
        }

        Ok(PurgePlan {
            retention,
            stranded,
            orphans,
        })
    }

    fn delete_checksums(&self, plan: &PurgePlan, report: &mut PurgeReport) -> Result<()> {
        if !plan.stranded.is_empty() {
            info!(count = plan.stranded.len(), "retrying unreferenced blobs from earlier purges");
        }
        if !plan.orphans.is_empty() {
            info!(count = plan.orphans.len(), "reclaiming unregistered blobs");
        }

        // Rows of a path whose deletion failed still hold their references
        let candidates = plan.checksums();
        let mut doomed = Vec::with_capacity(candidates.len());
        for checksum in &candidates {
            match self.log.reference_count(checksum)? {
                0 => doomed.push(*checksum),
                references => debug!(checksum = %checksum, references, "still referenced, skipping"),
            }
        }
        if doomed.is_empty() {
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("abus-purge-{i}"))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to start purge workers: {e}")))?;

        let purged = AtomicUsize::new(0);
        let failures = AtomicUsize::new(0);
        let reclaimed = AtomicU64::new(0);
        let index = self.index;
        let orphans = &plan.orphans;

        let outcome = pool.install(|| {
            doomed.par_iter().try_for_each(|checksum| {
                let deleted = if orphans.contains(checksum) {
                    index.delete_orphan(checksum)
                } else {
                    index.delete(checksum)
                };
                match deleted {
                    Ok(bytes) => {
                        debug!(checksum = %checksum, bytes, "deleted blob");
                        purged.fetch_add(1, Ordering::Relaxed);
                        reclaimed.fetch_add(bytes, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) if !e.is_fatal() => {
                        warn!(checksum = %checksum, error = %e, "failed to delete blob");
                        failures.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
        });

        report.checksums_purged += purged.into_inner();
        report.failures += failures.into_inner();
        report.bytes_reclaimed += reclaimed.into_inner();

        outcome.inspect_err(|e| {
            error!(error = %e, "aborting purge");
        })
    }
}
