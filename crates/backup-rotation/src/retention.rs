/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Tiered retention classifier
//!
//! Records are split into five non-overlapping age bands measured back from a
//! single `now` snapshot:
//!
//! | Band    | Age range                                  | Survivors               |
//! |---------|--------------------------------------------|-------------------------|
//! | Hourly  | `ts >= now - hourly`                       | all                     |
//! | Daily   | `now - daily <= ts < now - hourly`         | newest per day          |
//! | Weekly  | `now - weekly <= ts < now - daily`         | newest per ISO week     |
//! | Monthly | `now - monthly <= ts < now - weekly`       | newest per month        |
//! | Yearly  | `ts < now - monthly`                       | newest per year or none |
//!
//! Calendar buckets are computed in UTC. Weekly buckets use ISO-8601 week
//! numbering, so the days around New Year that share a Monday-based week
//! land in the same bucket.

use crate::{
    error::{BackupError, Result},
    record::BackupRecord,
};
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    time::Duration,
};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const MONTH: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Retention windows, each measured back from the classification instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub hourly_window: Duration,
    pub daily_window: Duration,
    pub weekly_window: Duration,
    pub monthly_window: Duration,
    pub yearly_enabled: bool,
}

impl RetentionPolicy {
    /// Build a policy from window counts. A month counts as 30 days.
    pub fn from_counts(hours: u32, days: u32, weeks: u32, months: u32, yearly_enabled: bool) -> Self {
        Self {
            hourly_window: HOUR * hours,
            daily_window: DAY * days,
            weekly_window: WEEK * weeks,
            monthly_window: MONTH * months,
            yearly_enabled,
        }
    }

    /// Windows must nest: hourly <= daily <= weekly <= monthly.
    pub fn validate(&self) -> Result<()> {
        let windows = [
            ("hourly", self.hourly_window),
            ("daily", self.daily_window),
            ("weekly", self.weekly_window),
            ("monthly", self.monthly_window),
        ];

        for pair in windows.windows(2) {
            let (shorter_name, shorter) = pair[0];
            let (longer_name, longer) = pair[1];
            if longer < shorter {
                return Err(BackupError::Config(format!(
                    "Retention {} window ({}s) is shorter than the {} window ({}s)",
                    longer_name,
                    longer.as_secs(),
                    shorter_name,
                    shorter.as_secs()
                )));
            }
        }

        Ok(())
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_counts(24, 7, 4, 12, true)
    }
}

/// Age band a record falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Band {
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Hourly => "hourly",
            Band::Daily => "daily",
            Band::Weekly => "weekly",
            Band::Monthly => "monthly",
            Band::Yearly => "yearly",
        }
    }

    /// Calendar bucket of `timestamp` within this band. The hourly band
    /// has no buckets.
    pub fn bucket(&self, timestamp: DateTime<Utc>) -> Option<BucketKey> {
        match self {
            Band::Hourly => None,
            Band::Daily => Some(BucketKey::Day {
                year: timestamp.year(),
                ordinal: timestamp.ordinal(),
            }),
            Band::Weekly => {
                let week = timestamp.iso_week();
                Some(BucketKey::Week {
                    iso_year: week.year(),
                    week: week.week(),
                })
            }
            Band::Monthly => Some(BucketKey::Month {
                year: timestamp.year(),
                month: timestamp.month(),
            }),
            Band::Yearly => Some(BucketKey::Year {
                year: timestamp.year(),
            }),
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar grouping key used to pick one survivor per period
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BucketKey {
    Day { year: i32, ordinal: u32 },
    Week { iso_year: i32, week: u32 },
    Month { year: i32, month: u32 },
    Year { year: i32 },
}

impl BucketKey {
    pub fn band(&self) -> Band {
        match self {
            BucketKey::Day { .. } => Band::Daily,
            BucketKey::Week { .. } => Band::Weekly,
            BucketKey::Month { .. } => Band::Monthly,
            BucketKey::Year { .. } => Band::Yearly,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKey::Day { year, ordinal } => write!(f, "{}-D{:03}", year, ordinal),
            BucketKey::Week { iso_year, week } => write!(f, "{}-W{:02}", iso_year, week),
            BucketKey::Month { year, month } => write!(f, "{}-{:02}", year, month),
            BucketKey::Year { year } => write!(f, "{}", year),
        }
    }
}

/// Band boundaries derived from one `now` snapshot
#[derive(Debug, Clone, Copy)]
pub struct BandCutoffs {
    pub hourly: DateTime<Utc>,
    pub daily: DateTime<Utc>,
    pub weekly: DateTime<Utc>,
    pub monthly: DateTime<Utc>,
}

impl BandCutoffs {
    pub fn new(now: DateTime<Utc>, policy: &RetentionPolicy) -> Self {
        Self {
            hourly: cutoff(now, policy.hourly_window),
            daily: cutoff(now, policy.daily_window),
            weekly: cutoff(now, policy.weekly_window),
            monthly: cutoff(now, policy.monthly_window),
        }
    }

    /// Bands are tested newest first, so every instant maps to exactly one
    /// band even if the policy windows do not nest.
    pub fn band(&self, timestamp: DateTime<Utc>) -> Band {
        if timestamp >= self.hourly {
            Band::Hourly
        } else if timestamp >= self.daily {
            Band::Daily
        } else if timestamp >= self.weekly {
            Band::Weekly
        } else if timestamp >= self.monthly {
            Band::Monthly
        } else {
            Band::Yearly
        }
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Number of surviving records per band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BandTally {
    pub hourly: usize,
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
    pub yearly: usize,
}

impl BandTally {
    fn record(&mut self, band: Band) {
        match band {
            Band::Hourly => self.hourly += 1,
            Band::Daily => self.daily += 1,
            Band::Weekly => self.weekly += 1,
            Band::Monthly => self.monthly += 1,
            Band::Yearly => self.yearly += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.hourly + self.daily + self.weekly + self.monthly + self.yearly
    }
}

/// Partition of a record set into survivors and purge candidates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionDecision {
    pub keep: BTreeSet<String>,
    pub delete: BTreeSet<String>,
    /// Ids whose names carry no decodable timestamp; never touched
    pub unparsed: BTreeSet<String>,
    pub tally: BandTally,
}

/// Decide which records survive under `policy` as of `now`.
///
/// Within each calendar bucket the record with the greatest timestamp
/// survives; equal timestamps resolve to the lexicographically smallest id.
/// A repeated id is classified once, by its first occurrence.
pub fn classify(
    now: DateTime<Utc>,
    records: &[BackupRecord],
    policy: &RetentionPolicy,
) -> RetentionDecision {
    let cutoffs = BandCutoffs::new(now, policy);
    let mut decision = RetentionDecision::default();
    let mut seen = HashSet::with_capacity(records.len());
    let mut survivors: BTreeMap<BucketKey, (DateTime<Utc>, &str)> = BTreeMap::new();
    let mut bucketed = Vec::new();

    for record in records {
        let id = record.id.as_str();
        if !seen.insert(id) {
            continue;
        }

        let Some(timestamp) = record.timestamp else {
            decision.unparsed.insert(record.id.clone());
            continue;
        };

        let band = cutoffs.band(timestamp);
        match band.bucket(timestamp) {
            None => {
                decision.keep.insert(record.id.clone());
                decision.tally.record(Band::Hourly);
            }
            Some(_) if band == Band::Yearly && !policy.yearly_enabled => {
                decision.delete.insert(record.id.clone());
            }
            Some(key) => {
                bucketed.push(id);
                survivors
                    .entry(key)
                    .and_modify(|current| {
                        if supersedes((timestamp, id), *current) {
                            *current = (timestamp, id);
                        }
                    })
                    .or_insert((timestamp, id));
            }
        }
    }

    for (key, (_, id)) in &survivors {
        decision.keep.insert((*id).to_string());
        decision.tally.record(key.band());
    }

    for id in bucketed {
        if !decision.keep.contains(id) {
            decision.delete.insert(id.to_string());
        }
    }

    decision
}

fn supersedes(candidate: (DateTime<Utc>, &str), current: (DateTime<Utc>, &str)) -> bool {
    candidate.0 > current.0 || (candidate.0 == current.0 && candidate.1 < current.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn record(id: &str, timestamp: DateTime<Utc>) -> BackupRecord {
        BackupRecord::new(id, format!("db_{}.sql.gz", timestamp.format("%Y%m%d_%H%M%S")), Some(timestamp))
    }

    fn now() -> DateTime<Utc> {
        at(2024, 3, 10, 12, 0)
    }

    #[test]
    fn test_empty_input() {
        let decision = classify(now(), &[], &RetentionPolicy::default());
        assert!(decision.keep.is_empty());
        assert!(decision.delete.is_empty());
        assert!(decision.unparsed.is_empty());
    }

    #[test]
    fn test_reference_scenario() {
        let records = vec![
            record("recent", at(2024, 3, 10, 8, 0)),
            record("morning", at(2024, 3, 5, 9, 0)),
            record("afternoon", at(2024, 3, 5, 15, 0)),
            record("old-year", at(2023, 1, 1, 0, 0)),
        ];

        let decision = classify(now(), &records, &RetentionPolicy::default());

        assert!(decision.keep.contains("recent"));
        assert!(decision.keep.contains("afternoon"));
        assert!(decision.delete.contains("morning"));
        assert!(decision.keep.contains("old-year"));
        assert_eq!(decision.tally.hourly, 1);
        assert_eq!(decision.tally.daily, 1);
        assert_eq!(decision.tally.yearly, 1);
    }

    #[test]
    fn test_newer_record_wins_year() {
        let records = vec![
            record("jan", at(2023, 1, 1, 0, 0)),
            record("feb", at(2023, 2, 14, 6, 30)),
        ];

        let decision = classify(now(), &records, &RetentionPolicy::default());

        assert_eq!(decision.keep, BTreeSet::from(["feb".to_string()]));
        assert_eq!(decision.delete, BTreeSet::from(["jan".to_string()]));
    }

    #[test]
    fn test_hourly_keeps_everything() {
        let records: Vec<_> = (0..24)
            .map(|hour| record(&format!("h{:02}", hour), now() - TimeDelta::hours(hour)))
            .collect();

        let decision = classify(now(), &records, &RetentionPolicy::default());

        assert_eq!(decision.keep.len(), 24);
        assert!(decision.delete.is_empty());
    }

    #[test]
    fn test_hourly_boundary_is_inclusive() {
        let boundary = now() - TimeDelta::hours(24);
        let records = vec![
            record("on-boundary", boundary),
            record("just-past", boundary - TimeDelta::seconds(1)),
            record("same-day", boundary - TimeDelta::hours(1)),
        ];

        let decision = classify(now(), &records, &RetentionPolicy::default());

        assert!(decision.keep.contains("on-boundary"));
        // Both older records share 2024-03-09 in the daily band.
        assert!(decision.keep.contains("just-past"));
        assert!(decision.delete.contains("same-day"));
    }

    #[test]
    fn test_tie_break_by_smallest_id() {
        let instant = at(2024, 3, 6, 10, 0);
        let records = vec![record("b", instant), record("a", instant), record("c", instant)];

        let decision = classify(now(), &records, &RetentionPolicy::default());
        assert!(decision.keep.contains("a"));
        assert!(decision.delete.contains("b"));
        assert!(decision.delete.contains("c"));

        let mut reversed = records.clone();
        reversed.reverse();
        assert_eq!(classify(now(), &reversed, &RetentionPolicy::default()), decision);
    }

    #[test]
    fn test_yearly_disabled_sweeps_old_records() {
        let policy = RetentionPolicy {
            yearly_enabled: false,
            ..RetentionPolicy::default()
        };
        let records = vec![
            record("y2021", at(2021, 6, 1, 0, 0)),
            record("y2022", at(2022, 6, 1, 0, 0)),
            record("recent", at(2024, 3, 10, 11, 0)),
        ];

        let decision = classify(now(), &records, &policy);

        assert!(decision.delete.contains("y2021"));
        assert!(decision.delete.contains("y2022"));
        assert_eq!(decision.keep, BTreeSet::from(["recent".to_string()]));
        assert_eq!(decision.tally.yearly, 0);
    }

    #[test]
    fn test_unparsed_records_are_untouched() {
        let records = vec![
            BackupRecord::new("foreign", "README.md", None),
            record("valid", at(2022, 1, 1, 0, 0)),
        ];

        let decision = classify(now(), &records, &RetentionPolicy::default());

        assert!(decision.unparsed.contains("foreign"));
        assert!(!decision.keep.contains("foreign"));
        assert!(!decision.delete.contains("foreign"));
    }

    #[test]
    fn test_duplicate_id_classified_once() {
        let records = vec![
            record("dup", at(2024, 3, 6, 10, 0)),
            record("dup", at(2024, 3, 6, 11, 0)),
            record("other", at(2024, 3, 6, 9, 0)),
        ];

        let decision = classify(now(), &records, &RetentionPolicy::default());

        assert!(decision.keep.contains("dup"));
        assert!(!decision.delete.contains("dup"));
        assert!(decision.delete.contains("other"));
    }

    #[test]
    fn test_iso_week_spans_new_year() {
        // 2024-12-30 (Monday) through 2025-01-05 is ISO week 2025-W01.
        // Both records are 17 to 21 days old, inside the weekly window.
        let now = at(2025, 1, 20, 0, 0);
        let records = vec![
            record("monday", at(2024, 12, 30, 12, 0)),
            record("thursday", at(2025, 1, 2, 12, 0)),
        ];
        let policy = RetentionPolicy::default();
        let cutoffs = BandCutoffs::new(now, &policy);
        assert_eq!(cutoffs.band(at(2024, 12, 30, 12, 0)), Band::Weekly);
        assert_eq!(cutoffs.band(at(2025, 1, 2, 12, 0)), Band::Weekly);

        let decision = classify(now, &records, &policy);

        assert_eq!(decision.keep, BTreeSet::from(["thursday".to_string()]));
        assert_eq!(decision.delete, BTreeSet::from(["monday".to_string()]));
        assert_eq!(decision.tally.weekly, 1);
        assert_eq!(
            Band::Weekly.bucket(at(2024, 12, 30, 12, 0)),
            Some(BucketKey::Week { iso_year: 2025, week: 1 })
        );
    }

    #[test]
    fn test_monthly_buckets() {
        let records = vec![
            record("sep-early", at(2023, 9, 2, 0, 0)),
            record("sep-late", at(2023, 9, 28, 0, 0)),
            record("oct", at(2023, 10, 15, 0, 0)),
        ];

        let decision = classify(now(), &records, &RetentionPolicy::default());

        assert!(decision.keep.contains("sep-late"));
        assert!(decision.keep.contains("oct"));
        assert!(decision.delete.contains("sep-early"));
        assert_eq!(decision.tally.monthly, 2);
    }

    #[test]
    fn test_second_pass_deletes_nothing() {
        let records: Vec<_> = (0..400)
            .map(|i| record(&format!("r{:04}", i), now() - TimeDelta::hours(i * 7)))
            .collect();
        let policy = RetentionPolicy::default();

        let first = classify(now(), &records, &policy);
        assert!(!first.delete.is_empty());

        let survivors: Vec<_> = records
            .into_iter()
            .filter(|record| first.keep.contains(&record.id))
            .collect();
        let second = classify(now(), &survivors, &policy);

        assert!(second.delete.is_empty());
        assert_eq!(second.keep, first.keep);
    }

    #[test]
    fn test_oversized_window_saturates() {
        let policy = RetentionPolicy {
            monthly_window: Duration::from_secs(u64::MAX),
            ..RetentionPolicy::default()
        };
        let records = vec![
            record("a", at(1990, 1, 1, 0, 0)),
            record("b", at(1990, 1, 2, 0, 0)),
        ];

        let decision = classify(now(), &records, &policy);

        // Everything older than the weekly window lands in one monthly bucket.
        assert_eq!(decision.keep, BTreeSet::from(["b".to_string()]));
        assert_eq!(decision.tally.yearly, 0);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetentionPolicy::default().validate().is_ok());
        assert!(RetentionPolicy::from_counts(48, 1, 4, 12, true).validate().is_err());
        assert!(RetentionPolicy::from_counts(0, 0, 0, 0, false).validate().is_ok());
    }

    #[test]
    fn test_overlapping_policy_still_partitions() {
        let policy = RetentionPolicy::from_counts(24 * 10, 7, 4, 12, true);
        let records: Vec<_> = (0..50)
            .map(|i| record(&format!("r{}", i), now() - TimeDelta::hours(i * 13)))
            .collect();

        let decision = classify(now(), &records, &policy);

        assert_eq!(decision.keep.len() + decision.delete.len(), records.len());
        assert!(decision.keep.is_disjoint(&decision.delete));
    }
}
