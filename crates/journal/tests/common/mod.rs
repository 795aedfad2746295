//! Shared fixtures for journal integration tests

#![allow(dead_code)]

use abus_core::hash::hash_bytes;
use abus_core::{make_run_name, Archive, Checksum, FsArchive, RunIndexEntry, RunName};
use abus_journal::{open_catalog, BackupLog, ChecksumIndex, PurgeEngine, PurgeReport, RetentionSchedule};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

pub const DAY: f64 = 86_400.0;
pub const NOW: f64 = 1_700_000_000.0;

/// Archive + catalog in a temporary directory
pub struct TestArchive {
    pub dir: TempDir,
    pub archive: Arc<FsArchive>,
    pub log: BackupLog,
    pub index: ChecksumIndex,
}

impl TestArchive {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(FsArchive::open(dir.path()).unwrap());
        let db = open_catalog(dir.path()).unwrap();
        let log = BackupLog::open(&db).unwrap();
        let index = ChecksumIndex::open(&db, archive.clone()).unwrap();
        Self {
            dir,
            archive,
            log,
            index,
        }
    }

    /// Record `content` as the version of `path` backed up `age_days` before `NOW`
    pub fn record_aged(&self, path: &str, age_days: f64, content: &str) -> Checksum {
        self.record_at(path, NOW - age_days * DAY, content)
    }

    pub fn record_at(&self, path: &str, timestamp: f64, content: &str) -> Checksum {
        let checksum = Checksum::new(hash_bytes(content.as_bytes()), false);
        self.index.store(&checksum, content.as_bytes()).unwrap();
        let run = make_run_name(timestamp).unwrap();
        self.log.add_entry(&run, path, timestamp, &checksum).unwrap();
        self.write_run_index(&run);
        checksum
    }

    pub fn write_run_index(&self, run: &RunName) {
        let rows: Vec<RunIndexEntry> = self
            .log
            .entries_for_run(run)
            .unwrap()
            .into_iter()
            .map(RunIndexEntry::from)
            .collect();
        self.archive.write_run_index(run, &rows).unwrap();
    }

    pub fn purge(&self, schedule: &RetentionSchedule, now: f64) -> PurgeReport {
        PurgeEngine::new(&self.log, &self.index, schedule.clone())
            .run_purge(now)
            .unwrap()
    }

    /// Every surviving row's checksum is still registered and stored
    pub fn assert_no_dangling(&self) {
        for (path, history) in self.log.snapshot().unwrap() {
            for entry in history {
                let location = self
                    .index
                    .location_of(&entry.checksum)
                    .unwrap()
                    .unwrap_or_else(|| panic!("{path}@{} lost {}", entry.run_name, entry.checksum));
                assert!(self.archive.blob_exists(&location), "{location} missing on disk");
            }
        }
    }

    pub fn latest_runs(&self) -> BTreeMap<String, RunName> {
        self.log
            .all_paths()
            .into_iter()
            .map(|path| {
                let latest = self.log.latest_for_path(&path).unwrap();
                (path, latest)
            })
            .collect()
    }
}

pub fn schedule(rounders: &[(f64, i64)], final_slots: i64) -> RetentionSchedule {
    RetentionSchedule::new(rounders, final_slots).unwrap()
}
