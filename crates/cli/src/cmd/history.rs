//! Show every stored version of one path

use super::Catalog;
use crate::settings::Settings;
use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;

pub fn run(settings: &Settings, path: &str) -> Result<()> {
    let catalog = Catalog::open(settings)?;
    let history = catalog.log.history_for_path(path)?;

    if history.is_empty() {
        println!("{}", format!("No versions recorded for {path}").dimmed());
        return Ok(());
    }

    println!("{} {}", "History of".bold(), path.cyan());
    for entry in history.iter().rev() {
        let location = catalog
            .index
            .location_of(&entry.checksum)?
            .unwrap_or_else(|| "missing".to_string());
        println!(
            "  {}  {}  {}  {}",
            entry.run_name.to_string().yellow(),
            util::format_timestamp(entry.timestamp),
            util::short_checksum(&entry.checksum.to_string()),
            location.dimmed()
        );
    }

    Ok(())
}
