//! Cron expressions with second granularity.
//!
//! Six fields are `sec min hour day-of-month month day-of-week`, with
//! day-of-week numbered `1 = SUN .. 7 = SAT`. Five fields drop the seconds
//! (fixed at zero) and number day-of-week `0 = SUN .. 6 = SAT`, `7` being
//! Sunday again. Every field accepts `*`, single values, `a-b` ranges,
//! `/step` suffixes and comma separated lists; the day fields also accept
//! `?`. Month and weekday names (`JAN`, `MON`, ...) are case insensitive.
//! When both day fields are restricted a day matches if either does.
//!
//! All times are UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};

/// How far ahead a schedule is searched before it is declared unsatisfiable.
const MAX_SEARCH_DAYS: i64 = 366 * 29;

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first entry of `names`.
    names_base: u32,
    allows_question_mark: bool,
}

const SECONDS: FieldSpec = FieldSpec {
    name: "seconds",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
    allows_question_mark: false,
};
const MINUTES: FieldSpec = FieldSpec {
    name: "minutes",
    ..SECONDS
};
const HOURS: FieldSpec = FieldSpec {
    name: "hours",
    max: 23,
    ..SECONDS
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
    allows_question_mark: true,
};
const MONTHS_FIELD: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTHS,
    names_base: 1,
    allows_question_mark: false,
};
const QUARTZ_WEEKDAYS: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 1,
    max: 7,
    names: &WEEKDAYS,
    names_base: 1,
    allows_question_mark: true,
};
const UNIX_WEEKDAYS: FieldSpec = FieldSpec {
    min: 0,
    max: 7,
    names_base: 0,
    ..QUARTZ_WEEKDAYS
};

/// Why an expression was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronParseError(String);

impl fmt::Display for CronParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CronParseError {}

/// Parsed field: a bit set of accepted values plus whether it was `*`/`?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    unrestricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1 << value) != 0
    }

    fn parse(raw: &str, spec: FieldSpec) -> Result<Self, CronParseError> {
        if raw == "*" || (raw == "?" && spec.allows_question_mark) {
            return Ok(Self {
                bits: range_bits(spec.min, spec.max, 1),
                unrestricted: true,
            });
        }

        let mut bits = 0;
        for part in raw.split(',') {
            bits |= parse_part(part, spec)?;
        }
        Ok(Self {
            bits,
            unrestricted: false,
        })
    }
}

fn range_bits(start: u32, end: u32, step: u32) -> u64 {
    (start..=end).step_by(step as usize).fold(0, |bits, v| bits | (1 << v))
}

fn parse_value(raw: &str, spec: FieldSpec) -> Result<u32, CronParseError> {
    let upper = raw.to_ascii_uppercase();
    let value = match spec.names.iter().position(|name| *name == upper) {
        Some(index) => index as u32 + spec.names_base,
        None => raw.parse::<u32>().map_err(|_| {
            CronParseError(format!("invalid {} value {raw:?}", spec.name))
        })?,
    };
    if value < spec.min || value > spec.max {
        return Err(CronParseError(format!(
            "{} value {value} outside {}-{}",
            spec.name, spec.min, spec.max
        )));
    }
    Ok(value)
}

fn parse_part(part: &str, spec: FieldSpec) -> Result<u64, CronParseError> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().map_err(|_| {
                CronParseError(format!("invalid {} step {step:?}", spec.name))
            })?;
            if step == 0 {
                return Err(CronParseError(format!("zero {} step", spec.name)));
            }
            (range, Some(step))
        }
        None => (part, None),
    };

    let (start, end) = match range {
        "*" => (spec.min, spec.max),
        _ => match range.split_once('-') {
            Some((start, end)) => (parse_value(start, spec)?, parse_value(end, spec)?),
            // `a/step` runs from `a` to the end of the field.
            None if step.is_some() => (parse_value(range, spec)?, spec.max),
            None => {
                let value = parse_value(range, spec)?;
                (value, value)
            }
        },
    };
    if start > end {
        return Err(CronParseError(format!(
            "{} range {start}-{end} is reversed",
            spec.name
        )));
    }
    Ok(range_bits(start, end, step.unwrap_or(1)))
}

/// A parsed recurring schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    seconds: Field,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    /// Normalized to `0 = SUN .. 6 = SAT`.
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (seconds, rest, weekdays) = match fields.as_slice() {
            [seconds, rest @ ..] if rest.len() == 5 => {
                (Field::parse(seconds, SECONDS)?, rest, QUARTZ_WEEKDAYS)
            }
            rest if rest.len() == 5 => (
                Field {
                    bits: 1,
                    unrestricted: false,
                },
                rest,
                UNIX_WEEKDAYS,
            ),
            _ => {
                return Err(CronParseError(format!(
                    "expected 5 or 6 fields, found {}",
                    fields.len()
                )));
            }
        };

        let raw_weekdays = Field::parse(rest[4], weekdays)?;
        let days_of_week = Field {
            bits: normalize_weekdays(raw_weekdays.bits, weekdays.names_base),
            unrestricted: raw_weekdays.unrestricted,
        };

        Ok(Self {
            source: fields.join(" "),
            seconds,
            minutes: Field::parse(rest[0], MINUTES)?,
            hours: Field::parse(rest[1], HOURS)?,
            days_of_month: Field::parse(rest[2], DAYS_OF_MONTH)?,
            months: Field::parse(rest[3], MONTHS_FIELD)?,
            days_of_week,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (
            self.days_of_month.unrestricted,
            self.days_of_week.unrestricted,
        ) {
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }

    /// Earliest matching time of day at or after `floor`.
    fn first_time_from(&self, floor: NaiveTime) -> Option<NaiveTime> {
        for hour in floor.hour()..24 {
            if !self.hours.contains(hour) {
                continue;
            }
            let min_start = if hour == floor.hour() { floor.minute() } else { 0 };
            for minute in min_start..60 {
                if !self.minutes.contains(minute) {
                    continue;
                }
                let sec_start = if hour == floor.hour() && minute == floor.minute() {
                    floor.second()
                } else {
                    0
                };
                if let Some(second) = (sec_start..60).find(|s| self.seconds.contains(*s)) {
                    return NaiveTime::from_hms_opt(hour, minute, second);
                }
            }
        }
        None
    }

    /// The first fire time strictly after `after`, `None` if the schedule
    /// never fires.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_nanosecond(0)? + Duration::seconds(1);
        let mut date = start.date_naive();
        let mut floor = start.time();

        for _ in 0..MAX_SEARCH_DAYS {
            if self.matches_day(date)
                && let Some(time) = self.first_time_from(floor)
            {
                return Some(date.and_time(time).and_utc());
            }
            date = date.succ_opt()?;
            floor = NaiveTime::MIN;
        }
        None
    }
}

/// Maps weekday bits onto `0 = SUN .. 6 = SAT`.
fn normalize_weekdays(bits: u64, base: u32) -> u64 {
    (0..=7u32)
        .filter(|v| bits & (1 << v) != 0)
        .fold(0, |acc, v| acc | (1 << ((v + 7 - base) % 7)))
}

impl FromStr for CronSchedule {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        CronSchedule::parse(expr).unwrap().next_after(after).unwrap()
    }

    #[test]
    fn test_daily_midnight() {
        assert_eq!(
            next("0 0 0 * * *", at(2024, 3, 1, 12, 0, 0)),
            at(2024, 3, 2, 0, 0, 0)
        );
    }

    #[test]
    fn test_next_is_strictly_after() {
        let midnight = at(2024, 3, 2, 0, 0, 0);
        assert_eq!(next("0 0 0 * * *", midnight), at(2024, 3, 3, 0, 0, 0));

        let within_second = midnight + Duration::milliseconds(400);
        assert_eq!(next("* * * * * *", within_second), at(2024, 3, 2, 0, 0, 1));
    }

    #[test]
    fn test_five_fields_fire_on_the_minute() {
        assert_eq!(
            next("*/15 * * * *", at(2024, 3, 1, 10, 7, 30)),
            at(2024, 3, 1, 10, 15, 0)
        );
    }

    #[test]
    fn test_weekday_numbering() {
        // 2024-03-01 is a Friday.
        let friday = at(2024, 3, 1, 12, 0, 0);
        assert_eq!(next("0 0 3 ? * 2", friday), at(2024, 3, 4, 3, 0, 0));
        assert_eq!(next("0 0 3 ? * MON", friday), at(2024, 3, 4, 3, 0, 0));
        assert_eq!(next("0 3 * * 1", friday), at(2024, 3, 4, 3, 0, 0));
        assert_eq!(next("0 3 * * 7", friday), at(2024, 3, 3, 3, 0, 0));
    }

    #[test]
    fn test_lists_ranges_and_names() {
        let expr = "30 5,35 8-10 1 JAN-MAR,dec *";
        assert_eq!(
            next(expr, at(2024, 3, 1, 10, 40, 0)),
            at(2024, 12, 1, 8, 5, 30)
        );
    }

    #[test]
    fn test_restricted_day_fields_are_ored() {
        // The 15th or any Sunday.
        let expr = "0 0 0 15 * SUN";
        assert_eq!(next(expr, at(2024, 3, 1, 0, 0, 0)), at(2024, 3, 3, 0, 0, 0));
        assert_eq!(next(expr, at(2024, 3, 10, 0, 0, 0)), at(2024, 3, 15, 0, 0, 0));
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(
            next("0 0 12 29 2 ?", at(2025, 1, 1, 0, 0, 0)),
            at(2028, 2, 29, 12, 0, 0)
        );
    }

    #[test]
    fn test_unsatisfiable_schedule_never_fires() {
        let schedule = CronSchedule::parse("0 0 0 30 2 ?").unwrap();
        assert_eq!(schedule.next_after(at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn test_rejects_malformed_expressions() {
        for expr in [
            "",
            "* * * *",
            "0 0 0 * * * * *",
            "60 * * * * *",
            "0 0 24 * * *",
            "0 0 0 0 * *",
            "0 0 0 * 13 *",
            "0 0 0 * * 8",
            "*/0 * * * * *",
            "0 10-5 * * * *",
            "0 0 0 L * ?",
            "0 ? 0 * * *",
            "not a cron",
        ] {
            assert!(CronSchedule::parse(expr).is_err(), "{expr:?} should fail");
        }
    }
}
