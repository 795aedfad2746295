//! Backup executor
//!
//! Walks the source tree once per run, storing new contents in the archive
//! and appending a row for every path whose checksum changed since its
//! latest recorded version.

use crate::backup_log::BackupLog;
use crate::checksum_index::ChecksumIndex;
use crate::{Error, Result};
use abus_core::blob::{checksum_for, encode_blob, should_compress};
use abus_core::hash::hash_file_stable;
use abus_core::{make_run_name, Checksum, RunIndexEntry, RunName};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Read attempts before a file that keeps changing is skipped
const HASH_RETRIES: u8 = 3;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub source_dir: PathBuf,
    /// Never descended into; usually the archive itself
    pub archive_dir: Option<PathBuf>,
    /// Gitignore-style patterns relative to `source_dir`
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupReport {
    pub run_name: RunName,
    pub files_seen: usize,
    pub entries_added: usize,
    pub blobs_stored: usize,
    pub bytes_stored: u64,
    /// Files that could not be read this run
    pub skipped: usize,
}

pub struct BackupExecutor<'a> {
    log: &'a BackupLog,
    index: &'a ChecksumIndex,
    source_dir: PathBuf,
    archive_dir: Option<PathBuf>,
    excludes: Gitignore,
}

impl<'a> BackupExecutor<'a> {
    pub fn new(log: &'a BackupLog, index: &'a ChecksumIndex, options: BackupOptions) -> Result<Self> {
        let source_dir = fs::canonicalize(&options.source_dir).map_err(|source| Error::Source {
            path: options.source_dir.display().to_string(),
            source,
        })?;
        // The archive may not exist yet; then it cannot be inside the walk either
        let archive_dir = options
            .archive_dir
            .as_deref()
            .and_then(|dir| fs::canonicalize(dir).ok());

        let mut builder = GitignoreBuilder::new(&source_dir);
        for pattern in &options.exclude {
            builder
                .add_line(None, pattern)
                .map_err(|e| Error::Configuration(format!("bad exclude pattern {pattern:?}: {e}")))?;
        }
        let excludes = builder
            .build()
            .map_err(|e| Error::Configuration(format!("bad exclude patterns: {e}")))?;

        Ok(Self {
            log,
            index,
            source_dir,
            archive_dir,
            excludes,
        })
    }

    /// Back up every changed file under the source directory
    pub fn run_backup(&self, now: f64) -> Result<BackupReport> {
        let run_name = make_run_name(now)?;
        info!(run = %run_name, source = %self.source_dir.display(), "starting backup");

        let mut report = BackupReport {
            run_name: run_name.clone(),
            files_seen: 0,
            entries_added: 0,
            blobs_stored: 0,
            bytes_stored: 0,
            skipped: 0,
        };

        let walker = WalkDir::new(&self.source_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_skipped(entry.path(), entry.file_type().is_dir()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "failed to walk source");
                    report.skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            report.files_seen += 1;

            let Some(path_key) = self.path_key(entry.path()) else {
                warn!(path = %entry.path().display(), "skipping non-UTF-8 path");
                report.skipped += 1;
                continue;
            };

            match self.backup_file(&run_name, entry.path(), &path_key, &mut report) {
                Ok(()) => {}
                Err(Error::Source { path, source }) => {
                    warn!(path, error = %source, "skipping unreadable file");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if report.entries_added > 0 {
            self.write_run_index(&run_name)?;
        }
        self.log.flush()?;

        info!(
            run = %run_name,
            files = report.files_seen,
            entries = report.entries_added,
            blobs = report.blobs_stored,
            bytes = report.bytes_stored,
            skipped = report.skipped,
            "backup complete"
        );
        Ok(report)
    }

    fn backup_file(
        &self,
        run_name: &RunName,
        path: &Path,
        path_key: &str,
        report: &mut BackupReport,
    ) -> Result<()> {
        let source_err = |source: std::io::Error| Error::Source {
            path: path.display().to_string(),
            source,
        };

        let timestamp = modified_timestamp(path).map_err(source_err)?;
        let hash = hash_file_stable(path, HASH_RETRIES).map_err(source_err)?;
        let checksum = Checksum::new(hash, should_compress(path));

        let unchanged = self
            .log
            .history_for_path(path_key)?
            .last()
            .is_some_and(|latest| latest.checksum == checksum);
        if unchanged {
            return Ok(());
        }

        let checksum = if self.index.exists(&checksum)? {
            checksum
        } else {
            // Re-derive from the bytes actually stored
            let data = fs::read(path).map_err(source_err)?;
            let checksum = checksum_for(path, &data);
            if !self.index.exists(&checksum)? {
                let stored = encode_blob(&checksum, &data).map_err(source_err)?;
                let record = self.index.store(&checksum, &stored)?;
                report.blobs_stored += 1;
                report.bytes_stored += record.stored_size;
            }
            checksum
        };

        self.log.add_entry(run_name, path_key, timestamp, &checksum)?;
        debug!(path = path_key, checksum = %checksum, "recorded version");
        report.entries_added += 1;
        Ok(())
    }

    fn write_run_index(&self, run_name: &RunName) -> Result<()> {
        let rows: Vec<RunIndexEntry> = self
            .log
            .entries_for_run(run_name)?
            .into_iter()
            .map(RunIndexEntry::from)
            .collect();
        self.index.archive().write_run_index(run_name, &rows)?;
        Ok(())
    }

    fn is_skipped(&self, path: &Path, is_dir: bool) -> bool {
        if path == self.source_dir {
            return false;
        }
        if let Some(archive) = &self.archive_dir {
            if path.starts_with(archive) {
                return true;
            }
        }
        self.excludes.matched(path, is_dir).is_ignore()
    }

    /// Source-relative path with `/` separators
    fn path_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.source_dir).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                _ => return None,
            }
        }
        Some(parts.join("/"))
    }
}

fn modified_timestamp(path: &Path) -> std::io::Result<f64> {
    let modified = fs::metadata(path)?.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(since_epoch.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use abus_core::{Archive, FsArchive};
    use std::sync::Arc;

    const T0: f64 = 1_700_000_000.0;

    struct Fixture {
        _archive_dir: tempfile::TempDir,
        source: tempfile::TempDir,
        archive: Arc<FsArchive>,
        log: BackupLog,
        index: ChecksumIndex,
    }

    fn fixture() -> Fixture {
        let archive_dir = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let archive = Arc::new(FsArchive::open(archive_dir.path()).unwrap());
        let db = sled::open(archive_dir.path().join("catalog.db")).unwrap();
        let log = BackupLog::open(&db).unwrap();
        let index = ChecksumIndex::open(&db, archive.clone()).unwrap();
        Fixture {
            _archive_dir: archive_dir,
            source,
            archive,
            log,
            index,
        }
    }

    fn executor<'a>(f: &'a Fixture, exclude: &[&str]) -> BackupExecutor<'a> {
        let options = BackupOptions {
            source_dir: f.source.path().to_path_buf(),
            archive_dir: None,
            exclude: exclude.iter().map(|p| p.to_string()).collect(),
        };
        BackupExecutor::new(&f.log, &f.index, options).unwrap()
    }

    #[test]
    fn test_unchanged_files_add_nothing() {
        let f = fixture();
        fs::write(f.source.path().join("file_a"), b"hello").unwrap();
        fs::create_dir(f.source.path().join("sub")).unwrap();
        fs::write(f.source.path().join("sub/file_b.gz"), b"raw").unwrap();

        let first = executor(&f, &[]).run_backup(T0).unwrap();
        assert_eq!(first.files_seen, 2);
        assert_eq!(first.entries_added, 2);
        assert_eq!(first.blobs_stored, 2);

        let history = f.log.history_for_path("sub/file_b.gz").unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].checksum.is_compressed());
        assert!(f.log.history_for_path("file_a").unwrap()[0].checksum.is_compressed());

        let second = executor(&f, &[]).run_backup(T0 + 3600.0).unwrap();
        assert_eq!(second.entries_added, 0);
        assert_eq!(second.blobs_stored, 0);
        assert_eq!(f.archive.list_run_indexes().unwrap(), vec![first.run_name]);
    }

    #[test]
    fn test_identical_contents_share_a_blob() {
        let f = fixture();
        fs::write(f.source.path().join("one.txt"), b"same").unwrap();
        fs::write(f.source.path().join("two.txt"), b"same").unwrap();

        let report = executor(&f, &[]).run_backup(T0).unwrap();
        assert_eq!(report.entries_added, 2);
        assert_eq!(report.blobs_stored, 1);
        assert_eq!(f.index.len(), 1);
    }

    #[test]
    fn test_exclude_patterns() {
        let f = fixture();
        fs::create_dir(f.source.path().join(".cache")).unwrap();
        fs::write(f.source.path().join(".cache/blob"), b"x").unwrap();
        fs::write(f.source.path().join("scratch.tmp"), b"x").unwrap();
        fs::write(f.source.path().join("keep.txt"), b"x").unwrap();

        let report = executor(&f, &[".cache/", "*.tmp"]).run_backup(T0).unwrap();
        assert_eq!(report.files_seen, 1);
        assert_eq!(f.log.all_paths().into_iter().collect::<Vec<_>>(), vec!["keep.txt".to_string()]);
    }

    #[test]
    fn test_archive_inside_source_is_skipped() {
        let source = tempfile::tempdir().unwrap();
        let archive_root = source.path().join("archive");
        let archive = Arc::new(FsArchive::open(&archive_root).unwrap());
        let db = sled::open(archive_root.join("catalog.db")).unwrap();
        let log = BackupLog::open(&db).unwrap();
        let index = ChecksumIndex::open(&db, archive).unwrap();
        fs::write(source.path().join("file_a"), b"data").unwrap();

        let options = BackupOptions {
            source_dir: source.path().to_path_buf(),
            archive_dir: Some(archive_root),
            exclude: Vec::new(),
        };
        let report = BackupExecutor::new(&log, &index, options)
            .unwrap()
            .run_backup(T0)
            .unwrap();
        assert_eq!(report.files_seen, 1);
    }

    #[test]
    fn test_bad_pattern_is_configuration_error() {
        let f = fixture();
        let options = BackupOptions {
            source_dir: f.source.path().to_path_buf(),
            archive_dir: None,
            exclude: vec!["a[".to_string()],
        };
        let result = BackupExecutor::new(&f.log, &f.index, options);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
