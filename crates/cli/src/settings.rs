//! Configuration file and environment handling
//!
//! Settings come from a TOML file layered with `ABUS__*` environment
//! variables (`ABUS__PURGE__WORKERS=8` sets `purge.workers`).

use abus_journal::purge::DEFAULT_WORKERS;
use abus_journal::RetentionSchedule;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of environment overrides
const ENV_PREFIX: &str = "ABUS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Directory tree to back up
    pub source_dir: PathBuf,
    /// Archive root holding the catalog, blobs and run indexes
    pub archive_dir: PathBuf,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub purge: PurgeSettings,
    #[serde(default)]
    pub backup: BackupSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// `[max_age_days, slots]` pairs, ascending by age
    pub rounders: Vec<(f64, i64)>,
    /// Slots for versions older than the last rounder
    pub final_slots: i64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        let schedule = RetentionSchedule::default();
        Self {
            rounders: schedule
                .tiers()
                .iter()
                .map(|tier| (tier.max_age_days, tier.slots as i64))
                .collect(),
            final_slots: schedule.final_slots() as i64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeSettings {
    /// Threads deleting blobs in parallel
    pub workers: usize,
}

impl Default for PurgeSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Gitignore-style patterns, relative to `source_dir`
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Settings {
    /// Load settings from `path` (or the default location) plus environment
    ///
    /// An explicit path must exist; the default one may be absent as long as
    /// the environment supplies the required keys.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (
                default_config_path().context("Could not determine config directory")?,
                false,
            ),
        };

        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(file.as_path()).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", file.display()))?
            .try_deserialize()
            .with_context(|| format!("Invalid configuration in {}", file.display()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check everything that can be checked before touching the archive
    pub fn validate(&self) -> Result<()> {
        if self.source_dir.as_os_str().is_empty() {
            anyhow::bail!("source_dir must not be empty");
        }
        if self.archive_dir.as_os_str().is_empty() {
            anyhow::bail!("archive_dir must not be empty");
        }
        if self.source_dir == self.archive_dir {
            anyhow::bail!("archive_dir must differ from source_dir");
        }
        if self.purge.workers == 0 {
            anyhow::bail!("purge.workers must be at least 1");
        }
        self.schedule()?;
        Ok(())
    }

    pub fn schedule(&self) -> Result<RetentionSchedule> {
        RetentionSchedule::new(&self.retention.rounders, self.retention.final_slots)
            .context("Invalid [retention] section")
    }

    /// Directory of the rolling log files
    pub fn log_dir(&self) -> PathBuf {
        self.archive_dir.join("logs")
    }

    /// Render back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// `$XDG_CONFIG_HOME/abus/abus.toml` or the platform equivalent
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("abus").join("abus.toml"))
}
