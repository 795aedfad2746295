//! Apply the retention schedule

use super::Catalog;
use crate::locks::ArchiveLock;
use crate::settings::Settings;
use crate::util;
use abus_journal::PurgeEngine;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;

/// Returns whether the purge finished without per-item failures
pub fn run(settings: &Settings, now: f64, dry_run: bool) -> Result<bool> {
    let _lock = ArchiveLock::acquire(&settings.archive_dir, "purge")?;
    let catalog = Catalog::open(settings)?;
    let mut engine = PurgeEngine::new(&catalog.log, &catalog.index, settings.schedule()?)
        .with_workers(settings.purge.workers)?;

    println!("{} as of {}", "Purge".bold(), util::format_timestamp(now).cyan());
    println!();

    if dry_run {
        let plan = engine.plan(now).context("Failed to plan purge")?;
        if plan.is_empty() {
            println!("{}", "Nothing to purge".dimmed());
            return Ok(true);
        }
        for candidate in &plan.retention.entries {
            println!(
                "  {} {} {}",
                candidate.run_name.to_string().yellow(),
                candidate.path,
                util::short_checksum(&candidate.checksum.to_string()).dimmed()
            );
        }
        println!();
        println!(
            "Would purge {} versions and {} blobs",
            plan.retention.entries.len(),
            plan.checksums().len()
        );
        if !plan.stranded.is_empty() || !plan.orphans.is_empty() {
            println!(
                "Unreferenced: {} left by earlier purges, {} never registered",
                plan.stranded.len(),
                plan.orphans.len()
            );
        }
        println!(
            "Kept: {}  Protected by other paths: {}",
            plan.retention.kept, plan.retention.protected
        );
        return Ok(true);
    }

    let report = engine.run_purge(now).context("Purge aborted")?;

    if report.entries_purged == 0 && report.checksums_purged == 0 {
        println!("{}", "Nothing to purge".dimmed());
    } else {
        println!("Versions purged: {}", report.entries_purged.to_string().yellow());
        println!("Blobs deleted:   {}", report.checksums_purged.to_string().yellow());
        println!("Runs rewritten:  {}", report.runs_rewritten);
        println!("Space freed:     {}", util::format_size(report.bytes_reclaimed).green());
    }

    if !report.is_clean() {
        println!(
            "{}",
            format!("{} items failed; re-run purge to retry", report.failures).red()
        );
    }
    Ok(report.is_clean())
}
