//! Back up the source directory into the archive

use super::Catalog;
use crate::locks::ArchiveLock;
use crate::settings::Settings;
use crate::util;
use abus_journal::{BackupExecutor, BackupOptions};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;

pub fn run(settings: &Settings, now: f64) -> Result<()> {
    let _lock = ArchiveLock::acquire(&settings.archive_dir, "backup")?;
    let catalog = Catalog::open(settings)?;

    let options = BackupOptions {
        source_dir: settings.source_dir.clone(),
        archive_dir: Some(settings.archive_dir.clone()),
        exclude: settings.backup.exclude.clone(),
    };
    let executor = BackupExecutor::new(&catalog.log, &catalog.index, options)
        .context("Failed to prepare backup")?;
    let report = executor.run_backup(now).context("Backup failed")?;

    println!("{} {}", "Backup".bold(), report.run_name.to_string().cyan());
    println!("Files scanned:   {}", report.files_seen);
    println!("Versions added:  {}", report.entries_added.to_string().yellow());
    println!("Blobs stored:    {}", report.blobs_stored);
    println!("Bytes stored:    {}", util::format_size(report.bytes_stored).green());
    if report.skipped > 0 {
        println!("Skipped:         {}", report.skipped.to_string().red());
    }

    Ok(())
}
