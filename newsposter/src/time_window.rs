//! Publishing slots.
//!
//! A run mode names one of three wall-clock slots in a fixed civil timezone.
//! The slot is recomputed from "now" on every call, so the resolver does not
//! care which day it runs on.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_TIMEZONE: &str = "Europe/Moscow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Overnight news, published in the morning
    Morning,
    /// Late morning to midday
    Midday,
    /// Afternoon to evening
    Evening,
}

#[derive(Debug, Error)]
#[error("unknown run mode '{0}' (expected morning, midday or evening)")]
pub struct UnknownMode(pub String);

impl FromStr for RunMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" => Ok(RunMode::Morning),
            "midday" => Ok(RunMode::Midday),
            "evening" => Ok(RunMode::Evening),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Morning => "morning",
            RunMode::Midday => "midday",
            RunMode::Evening => "evening",
        };
        f.write_str(name)
    }
}

/// Half-open interval `[start, end)` in a civil timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl TimeWindow {
    /// Whether `ts` falls inside the window. The timestamp is normalized to
    /// the window's timezone first; start is inclusive, end exclusive.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        let local = ts.with_timezone(&self.start.timezone());
        self.start <= local && local < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| anyhow!("invalid timezone '{}': {}", name, e))
}

/// Resolve `mode` against the current wall-clock time in `tz`.
pub fn resolve_window_now(mode: RunMode, tz: Tz) -> Result<TimeWindow> {
    resolve_window(mode, Utc::now().with_timezone(&tz))
}

/// Resolve `mode` relative to `now`.
///
/// - morning: previous day 23:15 to today 07:15
/// - midday: today 07:20 to today 13:15
/// - evening: today 15:15 to today 23:15
pub fn resolve_window(mode: RunMode, now: DateTime<Tz>) -> Result<TimeWindow> {
    let tz = now.timezone();
    let today = now.date_naive();
    let yesterday = today
        .pred_opt()
        .ok_or_else(|| anyhow!("no civil day before {}", today))?;

    let (start, end) = match mode {
        RunMode::Morning => (at(tz, yesterday, 23, 15)?, at(tz, today, 7, 15)?),
        RunMode::Midday => (at(tz, today, 7, 20)?, at(tz, today, 13, 15)?),
        RunMode::Evening => (at(tz, today, 15, 15)?, at(tz, today, 23, 15)?),
    };
    Ok(TimeWindow { start, end })
}

fn at(tz: Tz, day: NaiveDate, hour: u32, minute: u32) -> Result<DateTime<Tz>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| anyhow!("invalid wall-clock time {:02}:{:02}", hour, minute))?;
    let naive = day.and_time(time);
    // A DST gap has no such local time; shift past it.
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .ok_or_else(|| anyhow!("{} does not exist in {}", naive, tz.name()))
}
