//! Five-field cron schedules evaluated in UTC.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each field accepts
//! `*`, single values, ranges (`1-5`), steps (`*/15`, `10-40/10`) and lists
//! (`1,15,30`). Months and weekdays also accept three-letter names, and
//! weekday `7` is Sunday. The macros `@yearly`, `@annually`, `@monthly`,
//! `@weekly`, `@daily`, `@midnight` and `@hourly` are expanded before parsing.
//!
//! When both day-of-month and day-of-week are restricted, a day matching
//! either one qualifies.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::error::TriggerError;

const MONTH_NAMES: [&str; 12] = [
  "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// How far ahead `next_after` searches before giving up (e.g. `0 0 30 2 *`).
const SEARCH_YEARS: i32 = 5;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
  expression: String,
  minutes: u64,
  hours: u64,
  days_of_month: u64,
  months: u64,
  days_of_week: u64,
  dom_restricted: bool,
  dow_restricted: bool,
}

struct FieldSpec {
  name: &'static str,
  min: u32,
  max: u32,
  names: &'static [&'static str],
  names_start: u32,
}

impl CronSchedule {
  pub fn parse(expression: &str) -> Result<Self, TriggerError> {
    let err = |message: String| TriggerError::InvalidCron {
      expression: expression.to_string(),
      message,
    };

    let trimmed = expression.trim();
    let expanded = match trimmed.to_ascii_lowercase().as_str() {
      "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
      "@monthly" => "0 0 1 * *".to_string(),
      "@weekly" => "0 0 * * 0".to_string(),
      "@daily" | "@midnight" => "0 0 * * *".to_string(),
      "@hourly" => "0 * * * *".to_string(),
      other if other.starts_with('@') => return Err(err(format!("unknown macro '{}'", trimmed))),
      _ => trimmed.to_string(),
    };

    let fields: Vec<&str> = expanded.split_whitespace().collect();
    if fields.len() != 5 {
      return Err(err(format!("expected 5 fields, found {}", fields.len())));
    }

    let minutes = parse_field(
      fields[0],
      &FieldSpec {
        name: "minute",
        min: 0,
        max: 59,
        names: &[],
        names_start: 0,
      },
    )
    .map_err(err)?;
    let hours = parse_field(
      fields[1],
      &FieldSpec {
        name: "hour",
        min: 0,
        max: 23,
        names: &[],
        names_start: 0,
      },
    )
    .map_err(err)?;
    let days_of_month = parse_field(
      fields[2],
      &FieldSpec {
        name: "day-of-month",
        min: 1,
        max: 31,
        names: &[],
        names_start: 0,
      },
    )
    .map_err(err)?;
    let months = parse_field(
      fields[3],
      &FieldSpec {
        name: "month",
        min: 1,
        max: 12,
        names: &MONTH_NAMES,
        names_start: 1,
      },
    )
    .map_err(err)?;
    let mut days_of_week = parse_field(
      fields[4],
      &FieldSpec {
        name: "day-of-week",
        min: 0,
        max: 7,
        names: &DAY_NAMES,
        names_start: 0,
      },
    )
    .map_err(err)?;

    // 7 is an alias for Sunday
    if days_of_week & (1 << 7) != 0 {
      days_of_week = (days_of_week & !(1 << 7)) | 1;
    }

    Ok(Self {
      expression: trimmed.to_string(),
      minutes,
      hours,
      days_of_month,
      months,
      days_of_week,
      dom_restricted: !is_wildcard(fields[2]),
      dow_restricted: !is_wildcard(fields[4]),
    })
  }

  /// The expression this schedule was parsed from.
  pub fn expression(&self) -> &str {
    &self.expression
  }

  /// Whether the schedule fires at the minute containing `at`.
  pub fn matches(&self, at: DateTime<Utc>) -> bool {
    has(self.months, at.month())
      && self.day_matches(at)
      && has(self.hours, at.hour())
      && has(self.minutes, at.minute())
  }

  /// First occurrence strictly after `after`, at minute precision.
  pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
    let last_year = after.year() + SEARCH_YEARS;

    while t.year() <= last_year {
      if !has(self.months, t.month()) {
        let (year, month) = if t.month() == 12 {
          (t.year() + 1, 1)
        } else {
          (t.year(), t.month() + 1)
        };
        t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
        continue;
      }

      if !self.day_matches(t) {
        t = Utc
          .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
          .single()?
          + Duration::days(1);
        continue;
      }

      if !has(self.hours, t.hour()) {
        t = t.with_minute(0)? + Duration::hours(1);
        continue;
      }

      if !has(self.minutes, t.minute()) {
        t += Duration::minutes(1);
        continue;
      }

      return Some(t);
    }

    None
  }

  /// Most recent occurrence at or before `at`, searching forward from `since`.
  pub fn latest_between(
    &self,
    since: DateTime<Utc>,
    at: DateTime<Utc>,
  ) -> Option<DateTime<Utc>> {
    let mut latest = None;
    let mut cursor = since;
    while let Some(next) = self.next_after(cursor) {
      if next > at {
        break;
      }
      latest = Some(next);
      cursor = next;
    }
    latest
  }

  fn day_matches(&self, t: DateTime<Utc>) -> bool {
    let dom = has(self.days_of_month, t.day());
    let dow = has(self.days_of_week, t.weekday().num_days_from_sunday());
    match (self.dom_restricted, self.dow_restricted) {
      (true, true) => dom || dow,
      (true, false) => dom,
      (false, true) => dow,
      (false, false) => true,
    }
  }
}

impl fmt::Display for CronSchedule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.expression)
  }
}

fn has(mask: u64, value: u32) -> bool {
  mask & (1u64 << value) != 0
}

fn is_wildcard(field: &str) -> bool {
  field == "*" || field == "?"
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64, String> {
  let mut mask = 0u64;

  for part in field.split(',') {
    if part.is_empty() {
      return Err(format!("empty entry in {} field", spec.name));
    }

    let (range, step) = match part.split_once('/') {
      Some((range, step)) => {
        let step: u32 = step
          .parse()
          .map_err(|_| format!("invalid step '{}' in {} field", step, spec.name))?;
        if step == 0 {
          return Err(format!("step must be positive in {} field", spec.name));
        }
        (range, Some(step))
      }
      None => (part, None),
    };

    let (start, end) = if is_wildcard(range) {
      (spec.min, spec.max)
    } else if let Some((a, b)) = range.split_once('-') {
      (parse_value(a, spec)?, parse_value(b, spec)?)
    } else {
      let value = parse_value(range, spec)?;
      // `5/15` means "from 5 to the end, every 15"
      match step {
        Some(_) => (value, spec.max),
        None => (value, value),
      }
    };

    if start > end {
      return Err(format!(
        "range {}-{} is reversed in {} field",
        start, end, spec.name
      ));
    }

    let step = step.unwrap_or(1);
    let mut value = start;
    while value <= end {
      mask |= 1u64 << value;
      value += step;
    }
  }

  Ok(mask)
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, String> {
  let value = match raw.parse::<u32>() {
    Ok(value) => value,
    Err(_) => spec
      .names
      .iter()
      .position(|name| name.eq_ignore_ascii_case(raw))
      .map(|idx| idx as u32 + spec.names_start)
      .ok_or_else(|| format!("invalid value '{}' in {} field", raw, spec.name))?,
  };

  if value < spec.min || value > spec.max {
    return Err(format!(
      "value {} out of range {}-{} in {} field",
      value, spec.min, spec.max, spec.name
    ));
  }

  Ok(value)
}
