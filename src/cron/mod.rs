//! Five-field cron expression evaluation.
//!
//! Supports the classic `minute hour day-of-month month day-of-week` form
//! with `*`, single values, comma lists, inclusive ranges and `/step`
//! suffixes on `*` or a range. All evaluation is UTC at minute resolution.
//!
//! Day-of-month and day-of-week follow the vixie-cron rule: when both
//! fields are restricted (neither is `*`), a day matches if *either* field
//! matches; otherwise only the restricted field constrains.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 7)];

/// Upper bound on the `next_after` search, in days. Four years covers every
/// leap-day schedule; an expression with no match inside the window is
/// treated as never firing (e.g. `0 0 31 2 *`).
const SEARCH_DAYS: i64 = 4 * 366;

/// A parsed, validated cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    /// 0 = Sunday; 7 is folded into 0 at parse time.
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parse a five-field expression. Extra whitespace between fields
    /// collapses. Errors carry the zero-based index of the bad field.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::InvalidCron {
                field: 0,
                reason: format!(
                    "expected 5 whitespace-separated fields, got {}",
                    fields.len()
                ),
            });
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], 0)?,
            hours: parse_field(fields[1], 1)?,
            days_of_month: parse_field(fields[2], 2)?,
            months: parse_field(fields[3], 3)?,
            days_of_week: parse_field(fields[4], 4)?,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    /// The normalized expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Smallest minute-truncated instant strictly greater than `after` that
    /// matches the expression, or `None` when nothing matches within the
    /// search window.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        let start_date = start.date_naive();

        for day_offset in 0..=SEARCH_DAYS {
            let date = start_date + Duration::days(day_offset);
            if !self.day_matches(date) {
                continue;
            }
            let (first_hour, first_minute) = if day_offset == 0 {
                (start.hour(), start.minute())
            } else {
                (0, 0)
            };
            for &hour in &self.hours {
                if hour < first_hour {
                    continue;
                }
                for &minute in &self.minutes {
                    if hour == first_hour && minute < first_minute {
                        continue;
                    }
                    return date.and_hms_opt(hour, minute, 0).map(|t| t.and_utc());
                }
            }
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl std::str::FromStr for CronExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn invalid(field: usize, reason: impl Into<String>) -> Error {
    Error::InvalidCron {
        field,
        reason: reason.into(),
    }
}

/// Expand one field into its sorted, deduplicated value set.
fn parse_field(raw: &str, index: usize) -> Result<Vec<u32>> {
    let (min, max) = FIELD_RANGES[index];
    let mut values = Vec::new();

    for part in raw.split(',') {
        if part.is_empty() {
            return Err(invalid(index, "empty list element"));
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step_raw)) => {
                let step: u32 = step_raw
                    .parse()
                    .map_err(|_| invalid(index, format!("step '{step_raw}' is not a number")))?;
                if step == 0 {
                    return Err(invalid(index, "step must be positive"));
                }
                (base, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            (parse_value(a, index)?, parse_value(b, index)?)
        } else {
            let value = parse_value(base, index)?;
            if step != 1 {
                return Err(invalid(index, "step requires '*' or a range"));
            }
            (value, value)
        };

        if lo > hi {
            return Err(invalid(index, format!("range start {lo} exceeds end {hi}")));
        }

        let mut v = lo;
        while v <= hi {
            values.push(v);
            v += step;
        }
    }

    // Day-of-week treats 7 as a second spelling of Sunday.
    if index == 4 {
        for v in &mut values {
            *v %= 7;
        }
    }

    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_value(raw: &str, index: usize) -> Result<u32> {
    let (min, max) = FIELD_RANGES[index];
    let value: u32 = raw
        .parse()
        .map_err(|_| invalid(index, format!("'{raw}' is not a number")))?;
    if value < min || value > max {
        return Err(invalid(
            index,
            format!("{value} is out of range {min}-{max}"),
        ));
    }
    Ok(value)
}
