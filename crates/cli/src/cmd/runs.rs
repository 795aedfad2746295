//! List backup runs still present in the archive

use super::Catalog;
use crate::settings::Settings;
use crate::util;
use abus_core::Archive;
use anyhow::Result;
use owo_colors::OwoColorize;
use std::collections::BTreeSet;

pub fn run(settings: &Settings) -> Result<()> {
    let catalog = Catalog::open(settings)?;
    let runs = catalog.log.all_runs()?;
    let indexed: BTreeSet<_> = catalog.archive.list_run_indexes()?.into_iter().collect();

    if runs.is_empty() {
        println!("{}", "No backup runs".dimmed());
        return Ok(());
    }

    println!("{}", "Runs".bold());
    for run in &runs {
        let rows = catalog.log.entries_for_run(run)?.len();
        let marker = if indexed.contains(run) {
            String::new()
        } else {
            " (no run index)".red().to_string()
        };
        let started = util::format_timestamp(run.start_timestamp()? as f64);
        println!(
            "  {}  {}  {} files{}",
            run.to_string().yellow(),
            started.dimmed(),
            rows,
            marker
        );
    }
    println!();
    println!("{} runs, {} versions, {} blobs", runs.len(), catalog.log.len(), catalog.index.len());

    Ok(())
}
