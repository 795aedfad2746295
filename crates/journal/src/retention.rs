//! Tiered retention ("rounders") and purge decisions
//!
//! A schedule is a list of tiers `(max_age_days, slots)` plus the slot count
//! of the terminal era that holds everything older than the last tier. Each
//! path's non-latest versions are grouped by era; an era holding more
//! versions than it has slots keeps at most one version per slot.
//!
//! Decisions are pure: they take every path's history up front and never
//! touch storage. The live checksum set has to be computed across all paths
//! before anything is declared purgeable, because blobs are shared.

use crate::backup_log::HistoryEntry;
use crate::{Error, Result};
use abus_core::run_name::validate_timestamp;
use abus_core::{Checksum, RunName};
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// One explicit retention tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Upper bound (inclusive) of the ages this tier covers, in days
    pub max_age_days: f64,
    /// Maximum number of versions kept per path in this tier
    pub slots: usize,
}

/// Validated retention schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionSchedule {
    tiers: Vec<Tier>,
    final_slots: usize,
}

impl RetentionSchedule {
    /// Build a schedule from raw `(days, count)` pairs
    ///
    /// Thresholds must be finite, positive and strictly increasing; counts
    /// must not be negative.
    ///
    /// With `final_slots >= 1` the oldest version of every path survives.
    /// `final_slots = 0` lifts that guarantee: everything older than the last
    /// threshold is purged except a path's latest version.
    pub fn new(rounders: &[(f64, i64)], final_slots: i64) -> Result<Self> {
        let mut tiers = Vec::with_capacity(rounders.len());
        let mut previous = 0.0;

        for (i, &(days, count)) in rounders.iter().enumerate() {
            if !days.is_finite() || days <= 0.0 {
                return Err(Error::Configuration(format!(
                    "tier {i}: age threshold must be a positive number of days, got {days}"
                )));
            }
            if days <= previous {
                return Err(Error::Configuration(format!(
                    "tier {i}: age threshold {days} does not increase past {previous}"
                )));
            }
            tiers.push(Tier {
                max_age_days: days,
                slots: slot_count(count, &format!("tier {i}"))?,
            });
            previous = days;
        }

        Ok(Self {
            tiers,
            final_slots: slot_count(final_slots, "final era")?,
        })
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Slot count of the era beyond the last tier
    pub fn final_slots(&self) -> usize {
        self.final_slots
    }

    /// Index of the terminal era
    pub fn terminal_era(&self) -> usize {
        self.tiers.len()
    }

    /// Era of a version `age_days` old
    pub fn era_of(&self, age_days: f64) -> usize {
        self.tiers
            .iter()
            .position(|tier| tier.max_age_days >= age_days)
            .unwrap_or(self.tiers.len())
    }

    pub fn slots_for(&self, era: usize) -> usize {
        self.tiers
            .get(era)
            .map(|tier| tier.slots)
            .unwrap_or(self.final_slots)
    }

    /// Lower age bound (exclusive) of an era
    fn era_floor(&self, era: usize) -> f64 {
        match era {
            0 => 0.0,
            _ => self.tiers[era - 1].max_age_days,
        }
    }
}

impl Default for RetentionSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![
                Tier { max_age_days: 1.0, slots: 24 },
                Tier { max_age_days: 7.0, slots: 7 },
                Tier { max_age_days: 31.0, slots: 4 },
                Tier { max_age_days: 365.0, slots: 12 },
            ],
            final_slots: 1,
        }
    }
}

fn slot_count(count: i64, what: &str) -> Result<usize> {
    usize::try_from(count)
        .map_err(|_| Error::Configuration(format!("{what}: slot count must not be negative, got {count}")))
}

/// A backup row that is safe to delete
#[derive(Debug, Clone, PartialEq)]
pub struct PurgeCandidate {
    pub checksum: Checksum,
    pub path: String,
    pub run_name: RunName,
    pub timestamp: f64,
}

/// Outcome of one retention decision
#[derive(Debug, Clone, Default)]
pub struct PurgeSet {
    /// Rows to delete, ordered by path then run
    pub entries: Vec<PurgeCandidate>,
    /// Checksums no surviving row references
    pub checksums: BTreeSet<Checksum>,
    /// Rows kept by the schedule (latest versions included)
    pub kept: usize,
    /// Rows the schedule dropped but another path's kept version shares
    pub protected: usize,
}

impl PurgeSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.checksums.is_empty()
    }

    /// Purgeable run names grouped per path
    pub fn runs_by_path(&self) -> BTreeMap<&str, BTreeSet<RunName>> {
        let mut grouped: BTreeMap<&str, BTreeSet<RunName>> = BTreeMap::new();
        for candidate in &self.entries {
            grouped
                .entry(candidate.path.as_str())
                .or_default()
                .insert(candidate.run_name.clone());
        }
        grouped
    }
}

/// Decide which rows and checksums can be purged
///
/// `histories` must hold every path's complete history; a missing path makes
/// its blobs look unreferenced.
pub fn get_purgeable_backups(
    schedule: &RetentionSchedule,
    now: f64,
    histories: &BTreeMap<String, Vec<HistoryEntry>>,
) -> Result<PurgeSet> {
    let now = validate_timestamp(now)?;

    let mut kept: Vec<(&str, &HistoryEntry)> = Vec::new();
    let mut dropped: Vec<(&str, &HistoryEntry)> = Vec::new();

    for (path, history) in histories {
        let path = path.as_str();
        let Some(latest) = history.iter().max_by(|a, b| a.run_name.cmp(&b.run_name)) else {
            continue;
        };
        kept.push((path, latest));

        let mut eras: BTreeMap<usize, Vec<&HistoryEntry>> = BTreeMap::new();
        for entry in history.iter().filter(|e| e.run_name != latest.run_name) {
            eras.entry(schedule.era_of(age_days(now, entry.timestamp)))
                .or_default()
                .push(entry);
        }

        for (era, group) in eras {
            let keepers = select_keepers(schedule, era, now, &group);
            debug!(
                path,
                era,
                versions = group.len(),
                kept = keepers.len(),
                "retention group"
            );
            for (i, entry) in group.into_iter().enumerate() {
                if keepers.contains(&i) {
                    kept.push((path, entry));
                } else {
                    dropped.push((path, entry));
                }
            }
        }
    }

    // Live set: checksum -> paths holding a kept version of it
    let mut live: AHashMap<Checksum, AHashSet<&str>> = AHashMap::new();
    for &(path, entry) in &kept {
        live.entry(entry.checksum).or_default().insert(path);
    }

    let mut purge = PurgeSet {
        kept: kept.len(),
        ..PurgeSet::default()
    };

    for (path, entry) in dropped {
        let shared_elsewhere = live
            .get(&entry.checksum)
            .is_some_and(|paths| paths.iter().any(|p| *p != path));
        if shared_elsewhere {
            debug!(path, run = %entry.run_name, checksum = %entry.checksum, "kept for another path");
            purge.protected += 1;
            continue;
        }

        if !live.contains_key(&entry.checksum) {
            purge.checksums.insert(entry.checksum);
        }
        purge.entries.push(PurgeCandidate {
            checksum: entry.checksum,
            path: path.to_string(),
            run_name: entry.run_name.clone(),
            timestamp: entry.timestamp,
        });
    }

    purge
        .entries
        .sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.run_name.cmp(&b.run_name)));
    Ok(purge)
}

fn age_days(now: f64, timestamp: f64) -> f64 {
    (now - timestamp) / SECONDS_PER_DAY
}

/// Newer-first ordering: timestamp, then run name, then checksum
fn recency(a: &HistoryEntry, b: &HistoryEntry) -> Ordering {
    a.timestamp
        .total_cmp(&b.timestamp)
        .then_with(|| a.run_name.cmp(&b.run_name))
        .then_with(|| a.checksum.cmp(&b.checksum))
}

/// Indexes of the versions an era group keeps
///
/// The era's age range is split into equal slots and each occupied slot keeps
/// its newest version. The terminal era has no upper bound, so its range ends
/// at the oldest version present and its oldest slot keeps the oldest version
/// instead; with at least one slot, the oldest backup always survives.
fn select_keepers(
    schedule: &RetentionSchedule,
    era: usize,
    now: f64,
    group: &[&HistoryEntry],
) -> BTreeSet<usize> {
    let slots = schedule.slots_for(era);
    if group.len() <= slots {
        return (0..group.len()).collect();
    }
    if slots == 0 {
        return BTreeSet::new();
    }

    let terminal = era == schedule.terminal_era();
    let floor = schedule.era_floor(era);
    let ceiling = if terminal {
        group
            .iter()
            .map(|e| age_days(now, e.timestamp))
            .fold(floor, f64::max)
    } else {
        schedule.tiers()[era].max_age_days
    };
    let width = (ceiling - floor) / slots as f64;

    let mut best: BTreeMap<usize, usize> = BTreeMap::new();
    for (i, entry) in group.iter().enumerate() {
        let slot = if width > 0.0 {
            (((age_days(now, entry.timestamp) - floor) / width).floor().max(0.0) as usize).min(slots - 1)
        } else {
            0
        };
        let prefer_oldest = terminal && slot == slots - 1;

        match best.get(&slot) {
            Some(&current) => {
                let ord = recency(entry, group[current]);
                let better = if prefer_oldest {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };
                if better {
                    best.insert(slot, i);
                }
            }
            None => {
                best.insert(slot, i);
            }
        }
    }

    best.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use abus_core::hash::hash_bytes;
    use abus_core::make_run_name;

    const NOW: f64 = 1_700_000_000.0;

    fn checksum(tag: &str) -> Checksum {
        Checksum::new(hash_bytes(tag.as_bytes()), true)
    }

    /// History whose versions are `ages` days old, oldest first, each with
    /// its own content and a run name one minute apart.
    fn history(ages: &[f64], tag: &str) -> Vec<HistoryEntry> {
        ages.iter()
            .enumerate()
            .map(|(i, &age)| HistoryEntry {
                run_name: make_run_name(NOW - ages[0] * SECONDS_PER_DAY + i as f64 * 60.0).unwrap(),
                timestamp: NOW - age * SECONDS_PER_DAY,
                checksum: checksum(&format!("{tag}-{i}")),
            })
            .collect()
    }

    fn histories(items: Vec<(&str, Vec<HistoryEntry>)>) -> BTreeMap<String, Vec<HistoryEntry>> {
        items.into_iter().map(|(p, h)| (p.to_string(), h)).collect()
    }

    #[test]
    fn test_schedule_validation() {
        assert!(RetentionSchedule::new(&[(1.0, 3), (4.0, 9)], 1).is_ok());
        assert!(RetentionSchedule::new(&[], 0).is_ok());

        for bad in [
            RetentionSchedule::new(&[(4.0, 3), (4.0, 9)], 1),
            RetentionSchedule::new(&[(4.0, 3), (1.0, 9)], 1),
            RetentionSchedule::new(&[(0.0, 3)], 1),
            RetentionSchedule::new(&[(f64::NAN, 3)], 1),
            RetentionSchedule::new(&[(1.0, -1)], 1),
            RetentionSchedule::new(&[(1.0, 1)], -2),
        ] {
            assert!(matches!(bad, Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn test_era_membership() {
        let schedule = RetentionSchedule::new(&[(1.0, 3), (4.0, 9)], 2).unwrap();
        assert_eq!(schedule.era_of(-0.5), 0);
        assert_eq!(schedule.era_of(0.2), 0);
        assert_eq!(schedule.era_of(1.0), 0);
        assert_eq!(schedule.era_of(1.01), 1);
        assert_eq!(schedule.era_of(4.0), 1);
        assert_eq!(schedule.era_of(4.5), 2);
        assert_eq!(schedule.slots_for(2), 2);
    }

    #[test]
    fn test_single_version_is_never_purged() {
        let schedule = RetentionSchedule::new(&[(1.0, 0)], 0).unwrap();
        let set = get_purgeable_backups(&schedule, NOW, &histories(vec![("only", history(&[900.0], "o"))]))
            .unwrap();
        assert!(set.is_empty());
        assert_eq!(set.kept, 1);
    }

    #[test]
    fn test_group_within_slots_is_kept() {
        let schedule = RetentionSchedule::new(&[(1.0, 24)], 0).unwrap();
        let h = history(&[0.9, 0.5, 0.4, 0.1], "a");
        let set = get_purgeable_backups(&schedule, NOW, &histories(vec![("a", h)])).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_newest_version_per_slot_survives() {
        // Era 0 spans (0, 4] days with 2 slots: (0, 2] and (2, 4]
        let schedule = RetentionSchedule::new(&[(4.0, 2)], 0).unwrap();
        let h = history(&[3.9, 3.0, 2.5, 1.5, 0.5, 0.0], "a");
        let set = get_purgeable_backups(&schedule, NOW, &histories(vec![("a", h.clone())])).unwrap();

        let purged: Vec<_> = set.entries.iter().map(|c| c.run_name.clone()).collect();
        // Slot (2, 4] keeps 2.5, slot (0, 2] keeps 0.5; 0.0 is latest
        assert_eq!(purged, vec![h[0].run_name.clone(), h[1].run_name.clone(), h[3].run_name.clone()]);
        assert_eq!(set.checksums.len(), 3);
        assert_eq!(set.kept, 3);
    }

    #[test]
    fn test_terminal_era_keeps_oldest() {
        let schedule = RetentionSchedule::new(&[(1.0, 3)], 1).unwrap();
        let h = history(&[1000.0, 600.0, 200.0, 0.1], "a");
        let set = get_purgeable_backups(&schedule, NOW, &histories(vec![("a", h.clone())])).unwrap();

        let purged: BTreeSet<_> = set.entries.iter().map(|c| c.run_name.clone()).collect();
        assert!(!purged.contains(&h[0].run_name));
        assert!(purged.contains(&h[1].run_name));
        assert!(purged.contains(&h[2].run_name));
    }

    #[test]
    fn test_zero_final_slots_drops_old_versions() {
        let schedule = RetentionSchedule::new(&[(1.0, 3)], 0).unwrap();
        let h = history(&[1000.0, 600.0, 0.1], "a");
        let set = get_purgeable_backups(&schedule, NOW, &histories(vec![("a", h)])).unwrap();
        assert_eq!(set.entries.len(), 2);
    }

    #[test]
    fn test_identical_timestamps_are_deterministic() {
        let schedule = RetentionSchedule::new(&[(10.0, 1)], 0).unwrap();
        let mut h = history(&[5.0, 5.0, 5.0, 0.0], "same");
        let stamp = h[0].timestamp;
        for entry in h.iter_mut().take(3) {
            entry.timestamp = stamp;
        }

        let first = get_purgeable_backups(&schedule, NOW, &histories(vec![("a", h.clone())])).unwrap();
        let second = get_purgeable_backups(&schedule, NOW, &histories(vec![("a", h.clone())])).unwrap();
        assert_eq!(first.entries, second.entries);
        // The newest run name wins the tie
        assert_eq!(first.entries.len(), 2);
        assert!(first.entries.iter().all(|c| c.run_name != h[2].run_name));
    }

    #[test]
    fn test_checksum_kept_by_other_path_is_protected() {
        let schedule = RetentionSchedule::new(&[(1.0, 1)], 0).unwrap();
        let shared = checksum("shared");

        // Path x drops its old version; path y still keeps the same bytes as latest
        let mut x = history(&[500.0, 0.1], "x");
        x[0].checksum = shared;
        let mut y = history(&[0.0], "y");
        y[0].checksum = shared;

        let set = get_purgeable_backups(&schedule, NOW, &histories(vec![("x", x), ("y", y)])).unwrap();
        assert!(set.entries.is_empty());
        assert!(set.checksums.is_empty());
        assert_eq!(set.protected, 1);
    }

    #[test]
    fn test_checksum_kept_by_same_path_drops_row_only() {
        let schedule = RetentionSchedule::new(&[(1.0, 1)], 0).unwrap();
        // File reverted to its old content
        let mut h = history(&[500.0, 300.0, 0.1], "r");
        h[2].checksum = h[0].checksum;

        let set = get_purgeable_backups(&schedule, NOW, &histories(vec![("r", h.clone())])).unwrap();
        assert_eq!(set.entries.len(), 2);
        assert!(!set.checksums.contains(&h[0].checksum));
        assert!(set.checksums.contains(&h[1].checksum));
    }

    #[test]
    fn test_invalid_now_is_rejected() {
        let schedule = RetentionSchedule::default();
        assert!(get_purgeable_backups(&schedule, f64::NAN, &BTreeMap::new()).is_err());
    }
}
