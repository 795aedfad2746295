//! Print the effective configuration

use crate::settings::{self, Settings};
use anyhow::Result;
use owo_colors::OwoColorize;
use std::path::Path;

pub fn run(settings: &Settings, explicit: Option<&Path>) -> Result<()> {
    let source = match explicit {
        Some(path) => path.display().to_string(),
        None => settings::default_config_path()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "environment only".to_string()),
    };

    println!("{}", "Effective configuration".bold());
    println!("{}: {}\n", "Location".dimmed(), source.dimmed());
    print!("{}", settings.to_toml()?);

    Ok(())
}
