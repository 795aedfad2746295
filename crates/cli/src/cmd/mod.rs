//! CLI command implementations

pub mod backup;
pub mod config;
pub mod history;
pub mod purge;
pub mod runs;

use crate::settings::Settings;
use abus_core::FsArchive;
use abus_journal::{open_catalog, BackupLog, ChecksumIndex};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Everything a command needs from one archive
pub struct Catalog {
    pub archive: Arc<FsArchive>,
    pub log: BackupLog,
    pub index: ChecksumIndex,
}

impl Catalog {
    pub fn open(settings: &Settings) -> Result<Self> {
        let root = &settings.archive_dir;
        let archive = Arc::new(
            FsArchive::open(root).with_context(|| format!("Failed to open archive {}", root.display()))?,
        );
        let db = open_catalog(root).context("Failed to open catalog database")?;
        let log = BackupLog::open(&db).context("Failed to open backup log")?;
        let index = ChecksumIndex::open(&db, archive.clone()).context("Failed to open checksum index")?;
        Ok(Self { archive, log, index })
    }
}
