//! Calendar helpers: month bounds, CF time units and resample frequencies
//!
//! All timestamps are naive (UTC by convention). CF time coordinates are
//! decoded for the standard, gregorian and proleptic_gregorian calendars only.

use crate::errors::{FetchError, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use std::fmt;
use std::str::FromStr;

/// An inclusive range of calendar days.
///
/// A timestamp is inside the range when it falls on any of the days from
/// `start` to `end`, whatever its time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The whole calendar year.
    pub fn year(year: i32) -> Result<Self> {
        let start = ymd(year, 1, 1)?;
        let end = ymd(year, 12, 31)?;
        Ok(Self { start, end })
    }

    /// First instant inside the range.
    pub fn lower(&self) -> NaiveDateTime {
        self.start.and_time(NaiveTime::MIN)
    }

    /// First instant after the range.
    pub fn upper_exclusive(&self) -> NaiveDateTime {
        (self.end + Duration::days(1)).and_time(NaiveTime::MIN)
    }

    pub fn contains(&self, t: &NaiveDateTime) -> bool {
        *t >= self.lower() && *t < self.upper_exclusive()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

fn ymd(year: i32, month: u32, day: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| FetchError::TimeError(format!("invalid date {year}-{month:02}-{day:02}")))
}

/// Number of days in a calendar month, leap years included.
pub fn days_in_month(year: i32, month: u32) -> Result<u32> {
    let first = ymd(year, month, 1)?;
    let next = if month == 12 {
        ymd(year + 1, 1, 1)?
    } else {
        ymd(year, month + 1, 1)?
    };
    Ok((next - first).num_days() as u32)
}

/// First and last day of a calendar month.
pub fn month_bounds(year: i32, month: u32) -> Result<TimeRange> {
    if !(1..=12).contains(&month) {
        return Err(FetchError::TimeError(format!("month {month} out of range")));
    }
    let last_day = days_in_month(year, month)?;
    Ok(TimeRange::new(ymd(year, month, 1)?, ymd(year, month, last_day)?))
}

/// Unit of a CF `"<unit> since <epoch>"` time coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn seconds(self) -> f64 {
        match self {
            Self::Seconds => 1.0,
            Self::Minutes => 60.0,
            Self::Hours => 3600.0,
            Self::Days => 86400.0,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }
}

/// Parsed CF time encoding, e.g. `hours since 1979-10-01 00:00:00`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfTimeUnits {
    pub unit: TimeUnit,
    pub epoch: NaiveDateTime,
    pub calendar: String,
}

impl Default for CfTimeUnits {
    fn default() -> Self {
        Self {
            unit: TimeUnit::Hours,
            epoch: chrono::DateTime::UNIX_EPOCH.naive_utc(),
            calendar: "proleptic_gregorian".to_string(),
        }
    }
}

const SUPPORTED_CALENDARS: &[&str] = &["standard", "gregorian", "proleptic_gregorian"];

impl CfTimeUnits {
    /// Parse a CF `units` string with an optional `calendar` attribute.
    pub fn parse(units: &str, calendar: Option<&str>) -> Result<Self> {
        let calendar = calendar.unwrap_or("standard").to_lowercase();
        if !SUPPORTED_CALENDARS.contains(&calendar.as_str()) {
            return Err(FetchError::TimeError(format!(
                "unsupported calendar '{calendar}'"
            )));
        }

        let (unit, epoch) = units
            .split_once(" since ")
            .ok_or_else(|| FetchError::TimeError(format!("not a CF time unit: '{units}'")))?;

        let unit = match unit.trim().to_lowercase().as_str() {
            "seconds" | "second" | "secs" | "sec" | "s" => TimeUnit::Seconds,
            "minutes" | "minute" | "mins" | "min" => TimeUnit::Minutes,
            "hours" | "hour" | "hrs" | "hr" | "h" => TimeUnit::Hours,
            "days" | "day" | "d" => TimeUnit::Days,
            other => {
                return Err(FetchError::TimeError(format!(
                    "unsupported time unit '{other}'"
                )))
            }
        };

        Ok(Self {
            unit,
            epoch: parse_epoch(epoch.trim())?,
            calendar,
        })
    }

    /// Convert encoded offsets into timestamps, rounded to the millisecond.
    pub fn decode(&self, values: &[f64]) -> Result<Vec<NaiveDateTime>> {
        values
            .iter()
            .map(|&v| {
                if !v.is_finite() {
                    return Err(FetchError::TimeError(format!(
                        "non-finite time value {v}"
                    )));
                }
                let millis = (v * self.unit.seconds() * 1000.0).round();
                let out_of_range = || {
                    FetchError::TimeError(format!(
                        "time value {v} is out of range for {}",
                        self.units_string()
                    ))
                };
                if millis.abs() >= i64::MAX as f64 {
                    return Err(out_of_range());
                }
                Duration::try_milliseconds(millis as i64)
                    .and_then(|offset| self.epoch.checked_add_signed(offset))
                    .ok_or_else(out_of_range)
            })
            .collect()
    }

    /// Convert timestamps into offsets from the epoch in this unit.
    pub fn encode(&self, times: &[NaiveDateTime]) -> Vec<f64> {
        times
            .iter()
            .map(|t| {
                let millis = (*t - self.epoch).num_milliseconds() as f64;
                millis / 1000.0 / self.unit.seconds()
            })
            .collect()
    }

    pub fn units_string(&self) -> String {
        format!(
            "{} since {}",
            self.unit.as_str(),
            self.epoch.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

fn parse_epoch(s: &str) -> Result<NaiveDateTime> {
    let s = s
        .trim_end_matches(" UTC")
        .trim_end_matches('Z')
        .trim_end_matches("+00:00")
        .trim();

    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN))
        .map_err(|_| FetchError::TimeError(format!("unparseable epoch '{s}'")))
}

/// Target resolution for temporal resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Minutes(u32),
    Hours(u32),
    Days(u32),
    /// Calendar months, labelled by their first day
    MonthStart,
}

impl Frequency {
    /// Start of the bin containing `t`; fixed-width bins are anchored at `origin`.
    pub fn bin_start(&self, t: NaiveDateTime, origin: NaiveDateTime) -> NaiveDateTime {
        match self {
            Self::MonthStart => NaiveDate::from_ymd_opt(t.year(), t.month(), 1)
                .unwrap_or(t.date())
                .and_time(NaiveTime::MIN),
            _ => {
                let width = self.width_seconds();
                let offset = (t - origin).num_seconds();
                origin + Duration::seconds(offset.div_euclid(width) * width)
            }
        }
    }

    /// Start of the bin following the one starting at `bin`.
    pub fn next_bin(&self, bin: NaiveDateTime) -> NaiveDateTime {
        match self {
            Self::MonthStart => {
                let (y, m) = if bin.month() == 12 {
                    (bin.year() + 1, 1)
                } else {
                    (bin.year(), bin.month() + 1)
                };
                NaiveDate::from_ymd_opt(y, m, 1)
                    .unwrap_or(bin.date())
                    .and_time(NaiveTime::MIN)
            }
            _ => bin + Duration::seconds(self.width_seconds()),
        }
    }

    fn width_seconds(&self) -> i64 {
        match self {
            Self::Minutes(n) => i64::from(*n) * 60,
            Self::Hours(n) => i64::from(*n) * 3600,
            Self::Days(n) => i64::from(*n) * 86400,
            Self::MonthStart => 0,
        }
    }

    /// Short label used in output file names, `daily` for one day.
    pub fn file_suffix(&self) -> String {
        match self {
            Self::Days(1) => "daily".to_string(),
            Self::Hours(1) => "hourly".to_string(),
            Self::MonthStart => "monthly".to_string(),
            other => other.to_string(),
        }
    }
}

impl FromStr for Frequency {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (count, unit) = s.split_at(split);
        let count: u32 = if count.is_empty() {
            1
        } else {
            count
                .parse()
                .map_err(|_| FetchError::InvalidFrequency(s.to_string()))?
        };
        if count == 0 {
            return Err(FetchError::InvalidFrequency(s.to_string()));
        }

        match unit {
            "min" | "T" => Ok(Self::Minutes(count)),
            "h" | "H" => Ok(Self::Hours(count)),
            "D" | "d" => Ok(Self::Days(count)),
            "MS" if count == 1 => Ok(Self::MonthStart),
            _ => Err(FetchError::InvalidFrequency(s.to_string())),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minutes(n) => write!(f, "{n}min"),
            Self::Hours(n) => write!(f, "{n}h"),
            Self::Days(n) => write!(f, "{n}D"),
            Self::MonthStart => write!(f, "MS"),
        }
    }
}
