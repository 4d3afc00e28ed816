//! Retention planning. Pure: decides what to delete, never touches the filesystem.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use crate::policy::RetentionPolicy;

use super::Backup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Bucket {
    Day(NaiveDate),
    IsoWeek { year: i32, week: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    KeepAll,
    Thinned(Bucket),
    Expired,
}

fn band(created_at: DateTime<Utc>, now: DateTime<Utc>, policy: &RetentionPolicy) -> Band {
    let age = now.signed_duration_since(created_at);
    if age < Duration::days(i64::from(policy.keep_all_days)) {
        return Band::KeepAll;
    }
    if age <= Duration::days(i64::from(policy.daily_until_days)) {
        return Band::Thinned(Bucket::Day(created_at.date_naive()));
    }
    if age <= Duration::days(i64::from(policy.max_age_days)) {
        let week = created_at.iso_week();
        return Band::Thinned(Bucket::IsoWeek {
            year: week.year(),
            week: week.week(),
        });
    }
    Band::Expired
}

/// Backups to delete so that `backups` satisfies `policy` at `now`.
///
/// Inside the thinned bands only the newest backup of each day or ISO week survives. Backups
/// dated in the future are kept.
pub fn plan(backups: &[Backup], now: DateTime<Utc>, policy: &RetentionPolicy) -> Vec<Backup> {
    let mut ordered: Vec<&Backup> = backups.iter().collect();
    ordered.sort_by(|a, b| b.order_key().cmp(&a.order_key()));

    let mut claimed = HashSet::<Bucket>::new();
    let mut doomed = Vec::new();
    for backup in ordered {
        match band(backup.created_at, now, policy) {
            Band::KeepAll => {}
            Band::Thinned(bucket) => {
                if !claimed.insert(bucket) {
                    doomed.push(backup.clone());
                }
            }
            Band::Expired => doomed.push(backup.clone()),
        }
    }
    doomed
}
