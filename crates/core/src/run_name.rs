//! Canonical run names
//!
//! A run name is the UTC minute a backup ran in, rendered as
//! `YYYY_MM_DD_HHMM`. Every file backed up within the same minute belongs to
//! the same run. Names compare lexicographically in time order.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const RUN_NAME_FORMAT: &str = "%Y_%m_%d_%H%M";
const LAST_FOUR_DIGIT_YEAR: i64 = 253_402_300_799; // 9999-12-31T23:59:59Z

/// Time-bucketed identifier of a backup run
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunName(String);

impl RunName {
    /// Validate a run name read back from storage
    pub fn parse(s: &str) -> Result<Self> {
        let parsed = NaiveDateTime::parse_from_str(&format!("{s}_00"), "%Y_%m_%d_%H%M_%S")
            .map_err(|_| Error::InvalidRunName(s.to_string()))?;
        // Reject anything that does not re-render identically (unpadded fields etc.)
        if parsed.format(RUN_NAME_FORMAT).to_string() != s {
            return Err(Error::InvalidRunName(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unix timestamp of the first second of this run's bucket
    pub fn start_timestamp(&self) -> Result<i64> {
        NaiveDateTime::parse_from_str(&format!("{}_00", self.0), "%Y_%m_%d_%H%M_%S")
            .map(|dt| dt.and_utc().timestamp())
            .map_err(|_| Error::InvalidRunName(self.0.clone()))
    }
}

impl fmt::Display for RunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunName({})", self.0)
    }
}

impl TryFrom<String> for RunName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<RunName> for String {
    fn from(name: RunName) -> Self {
        name.0
    }
}

impl AsRef<str> for RunName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Check a timestamp is usable as an age or run reference
pub fn validate_timestamp(timestamp: f64) -> Result<f64> {
    if !timestamp.is_finite() || timestamp < 0.0 || timestamp > LAST_FOUR_DIGIT_YEAR as f64 {
        return Err(Error::InvalidTimestamp(timestamp));
    }
    Ok(timestamp)
}

/// Quantize a Unix timestamp (seconds) to its run name
pub fn make_run_name(timestamp: f64) -> Result<RunName> {
    let timestamp = validate_timestamp(timestamp)?;
    let dt: DateTime<Utc> = DateTime::from_timestamp(timestamp.floor() as i64, 0)
        .ok_or(Error::InvalidTimestamp(timestamp))?;
    Ok(RunName(dt.format(RUN_NAME_FORMAT).to_string()))
}
