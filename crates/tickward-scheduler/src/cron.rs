//! Six-field cron expressions with seconds resolution.
//!
//! Field order: `sec min hour day-of-month month day-of-week`.
//!
//! | Syntax     | Meaning                                   |
//! |------------|-------------------------------------------|
//! | `*` / `?`  | every value of the field                  |
//! | `a-b`      | inclusive range                           |
//! | `*/n`      | every n-th value starting at the minimum  |
//! | `a/n`      | every n-th value from `a` to the maximum  |
//! | `a-b/n`    | every n-th value inside the range         |
//! | `a,b,c`    | list of any of the above                  |
//!
//! Months accept `JAN`..`DEC`, weekdays `SUN`..`SAT` (0 or 7 = Sunday).
//! Evaluation is in UTC. When both day fields are restricted a day matches
//! if either of them matches, as in classic cron.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::error::{Result, SchedulerError};

/// How far ahead `next_after` searches before giving up.
const SEARCH_YEARS: i32 = 5;

struct Field {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const SECONDS: Field = Field { name: "seconds", min: 0, max: 59, names: &[] };
const MINUTES: Field = Field { name: "minutes", min: 0, max: 59, names: &[] };
const HOURS: Field = Field { name: "hours", min: 0, max: 23, names: &[] };
const DAYS_OF_MONTH: Field = Field { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTHS: Field = Field {
    name: "month",
    min: 1,
    max: 12,
    names: &["JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC"],
};
// 7 is accepted as an alias for Sunday and folded into bit 0 after parsing.
const DAYS_OF_WEEK: Field = Field {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

/// A parsed cron expression. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a six-field expression or one of the `@` descriptors.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let expanded = match trimmed {
            "@yearly" | "@annually" => "0 0 0 1 1 *",
            "@monthly" => "0 0 0 1 * *",
            "@weekly" => "0 0 0 * * 0",
            "@daily" | "@midnight" => "0 0 0 * * *",
            "@hourly" => "0 0 * * * *",
            other if other.starts_with('@') => {
                return Err(SchedulerError::invalid_schedule(expr, "unknown descriptor"));
            }
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(SchedulerError::invalid_schedule(
                expr,
                format!("expected 6 fields, found {}", fields.len()),
            ));
        }

        let parse = |raw: &str, field: &Field| {
            parse_field(raw, field).map_err(|reason| SchedulerError::invalid_schedule(expr, reason))
        };

        let mut days_of_week = parse(fields[5], &DAYS_OF_WEEK)?;
        if days_of_week & (1u64 << 7) != 0 {
            days_of_week = (days_of_week & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            expr: trimmed.to_string(),
            seconds: parse(fields[0], &SECONDS)?,
            minutes: parse(fields[1], &MINUTES)?,
            hours: parse(fields[2], &HOURS)?,
            days_of_month: parse(fields[3], &DAYS_OF_MONTH)?,
            months: parse(fields[4], &MONTHS)?,
            days_of_week,
            dom_restricted: !is_wildcard(fields[3]),
            dow_restricted: !is_wildcard(fields[5]),
        })
    }

    /// The expression as it was registered.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `after`, truncated to whole seconds.
    ///
    /// Returns `None` when nothing matches within the search horizon
    /// (e.g. `0 0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);
        let limit = t.year() + SEARCH_YEARS;

        loop {
            if t.year() > limit {
                return None;
            }
            if !has(self.months, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(&t) {
                t = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !has(self.seconds, t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = has(self.days_of_month, t.day());
        let dow = has(self.days_of_week, t.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expr)
    }
}

/// Parse `expr` and return its first fire time strictly after `after`.
pub fn next_fire_time(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronSchedule::parse(expr)?
        .next_after(after)
        .ok_or_else(|| SchedulerError::invalid_schedule(expr, "expression never fires"))
}

fn has(bits: u64, value: u32) -> bool {
    bits & (1u64 << value) != 0
}

fn is_wildcard(raw: &str) -> bool {
    raw.starts_with('*') || raw.starts_with('?')
}

fn parse_field(raw: &str, field: &Field) -> std::result::Result<u64, String> {
    let mut bits = 0u64;

    for part in raw.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field", field.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in {} field", field.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", field.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" || range == "?" {
            (field.min, field.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, field)?, parse_value(b, field)?)
        } else {
            let v = parse_value(range, field)?;
            // `a/n` runs from a to the end of the field.
            (v, if step.is_some() { field.max } else { v })
        };

        if lo > hi {
            return Err(format!("range {lo}-{hi} is reversed in {} field", field.name));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            bits |= 1u64 << v;
        }
    }

    Ok(bits)
}

fn parse_value(raw: &str, field: &Field) -> std::result::Result<u32, String> {
    let value = match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => field
            .names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(raw))
            .map(|i| i as u32 + field.min)
            .ok_or_else(|| format!("invalid value '{raw}' in {} field", field.name))?,
    };
    if value < field.min || value > field.max {
        return Err(format!(
            "value {value} out of range {}-{} in {} field",
            field.min, field.max, field.name
        ));
    }
    Ok(value)
}
