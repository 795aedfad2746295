//! Backup log, retention and purge
//!
//! This crate provides:
//! - The append-only backup log (sled embedded DB)
//! - The checksum index sharing that database
//! - Tiered retention ("rounders") decisions
//! - The purge engine that applies them
//! - A thin backup executor feeding the log

pub mod backup;
pub mod backup_log;
pub mod checksum_index;
pub mod error;
pub mod purge;
pub mod retention;

// Re-exports
pub use backup::{BackupExecutor, BackupOptions, BackupReport};
pub use backup_log::{BackupEntry, BackupLog, HistoryEntry};
pub use checksum_index::{ChecksumIndex, ChecksumRecord};
pub use error::Error;
pub use purge::{PurgeEngine, PurgePlan, PurgeReport, PurgeState};
pub use retention::{get_purgeable_backups, PurgeCandidate, PurgeSet, RetentionSchedule, Tier};

/// Result type for journal operations
pub type Result<T> = std::result::Result<T, Error>;

/// Open the catalog database shared by the backup log and checksum index
pub fn open_catalog(archive_root: &std::path::Path) -> Result<sled::Db> {
    Ok(sled::open(archive_root.join("catalog.db"))?)
}
