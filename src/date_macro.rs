//! Datetime macros (`@now`, `@todayStart`, `@day-7`, ...).
//!
//! Macros are resolved while parsing, against one snapshot of "now" taken
//! from an injected [`Clock`]. The engine never reads the system time on its
//! own, so a [`FixedClock`] makes resolution fully deterministic.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use serde::Serialize;

use crate::error::{MacroError, MacroErrorKind};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl OffsetUnit {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "second" => Some(OffsetUnit::Second),
            "minute" => Some(OffsetUnit::Minute),
            "hour" => Some(OffsetUnit::Hour),
            "day" => Some(OffsetUnit::Day),
            "week" => Some(OffsetUnit::Week),
            "month" => Some(OffsetUnit::Month),
            "year" => Some(OffsetUnit::Year),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetUnit::Second => "second",
            OffsetUnit::Minute => "minute",
            OffsetUnit::Hour => "hour",
            OffsetUnit::Day => "day",
            OffsetUnit::Week => "week",
            OffsetUnit::Month => "month",
            OffsetUnit::Year => "year",
        }
    }
}

/// A recognised macro, before it is applied to a clock snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DateMacro {
    Now,
    TodayStart,
    TodayEnd,
    Yesterday,
    Tomorrow,
    MonthStart,
    MonthEnd,
    YearStart,
    YearEnd,
    Offset { unit: OffsetUnit, amount: i64 },
}

impl DateMacro {
    /// Recognises a macro name as it appears after `@`.
    pub fn from_name(name: &str) -> Result<Self, MacroErrorKind> {
        let base = match name {
            "now" => Some(DateMacro::Now),
            "today" | "todayStart" => Some(DateMacro::TodayStart),
            "todayEnd" => Some(DateMacro::TodayEnd),
            "yesterday" => Some(DateMacro::Yesterday),
            "tomorrow" => Some(DateMacro::Tomorrow),
            "monthStart" => Some(DateMacro::MonthStart),
            "monthEnd" => Some(DateMacro::MonthEnd),
            "yearStart" => Some(DateMacro::YearStart),
            "yearEnd" => Some(DateMacro::YearEnd),
            _ => None,
        };
        if let Some(base) = base {
            return Ok(base);
        }

        let Some(sign_at) = name.find(|c| c == '+' || c == '-') else {
            return match OffsetUnit::from_name(name) {
                Some(_) => Err(MacroErrorKind::MissingOffset),
                None => Err(MacroErrorKind::Unknown),
            };
        };

        let (unit, suffix) = name.split_at(sign_at);
        let unit = OffsetUnit::from_name(unit).ok_or(MacroErrorKind::Unknown)?;
        let digits = &suffix[1..];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MacroErrorKind::MalformedOffset);
        }
        let magnitude: i64 = digits.parse().map_err(|_| MacroErrorKind::MalformedOffset)?;
        let amount = if suffix.starts_with('-') { -magnitude } else { magnitude };
        Ok(DateMacro::Offset { unit, amount })
    }

    /// Applies the macro to a snapshot of the current instant.
    pub fn apply(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, MacroErrorKind> {
        let today = now.date_naive();
        let resolved = match *self {
            DateMacro::Now => Some(now),
            DateMacro::TodayStart => start_of(today),
            DateMacro::TodayEnd => end_of(today),
            DateMacro::Yesterday => now.checked_sub_signed(Duration::days(1)),
            DateMacro::Tomorrow => now.checked_add_signed(Duration::days(1)),
            DateMacro::MonthStart => today.with_day(1).and_then(start_of),
            DateMacro::MonthEnd => last_day_of_month(today).and_then(end_of),
            DateMacro::YearStart => {
                NaiveDate::from_ymd_opt(today.year(), 1, 1).and_then(start_of)
            }
            DateMacro::YearEnd => NaiveDate::from_ymd_opt(today.year(), 12, 31).and_then(end_of),
            DateMacro::Offset { unit, amount } => apply_offset(now, unit, amount),
        };
        resolved.ok_or(MacroErrorKind::OutOfRange)
    }
}

impl fmt::Display for DateMacro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateMacro::Now => write!(f, "now"),
            DateMacro::TodayStart => write!(f, "todayStart"),
            DateMacro::TodayEnd => write!(f, "todayEnd"),
            DateMacro::Yesterday => write!(f, "yesterday"),
            DateMacro::Tomorrow => write!(f, "tomorrow"),
            DateMacro::MonthStart => write!(f, "monthStart"),
            DateMacro::MonthEnd => write!(f, "monthEnd"),
            DateMacro::YearStart => write!(f, "yearStart"),
            DateMacro::YearEnd => write!(f, "yearEnd"),
            DateMacro::Offset { unit, amount } => write!(f, "{}{:+}", unit.as_str(), amount),
        }
    }
}

/// Resolves the macro named `name` (without `@`) found at `offset` in the
/// source, against the snapshot `now`.
pub fn resolve(
    name: &str,
    offset: usize,
    now: DateTime<Utc>,
) -> Result<(DateMacro, DateTime<Utc>), MacroError> {
    let error = |kind| MacroError {
        offset,
        name: name.to_string(),
        kind,
    };
    let date_macro = DateMacro::from_name(name).map_err(error)?;
    let instant = date_macro.apply(now).map_err(error)?;
    Ok((date_macro, instant))
}

fn start_of(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_milli_opt(0, 0, 0, 0).map(|dt| dt.and_utc())
}

fn end_of(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_milli_opt(23, 59, 59, 999).map(|dt| dt.and_utc())
}

fn last_day_of_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.pred_opt()
}

fn apply_offset(now: DateTime<Utc>, unit: OffsetUnit, amount: i64) -> Option<DateTime<Utc>> {
    let seconds_per_unit = match unit {
        OffsetUnit::Second => 1,
        OffsetUnit::Minute => 60,
        OffsetUnit::Hour => 3_600,
        OffsetUnit::Day => 86_400,
        OffsetUnit::Week => 604_800,
        OffsetUnit::Month | OffsetUnit::Year => {
            let months_per_unit = if unit == OffsetUnit::Year { 12 } else { 1 };
            let months = amount.checked_mul(months_per_unit)?;
            let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
            return if months < 0 {
                now.checked_sub_months(magnitude)
            } else {
                now.checked_add_months(magnitude)
            };
        }
    };
    let seconds = amount.checked_mul(seconds_per_unit)?;
    now.checked_add_signed(Duration::try_seconds(seconds)?)
}
