//! Cron schedules of backup policies.
//!
//! Expressions use the five field format known from Kubernetes `CronJob`s (minute, hour, day of
//! month, month, day of week) or one of the `@hourly`, `@daily`, `@weekly`, `@monthly` and
//! `@yearly` macros. Schedules are evaluated in UTC.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use jiff::{SignedDuration, Timestamp};
use snafu::{OptionExt, ResultExt, Snafu};

/// Upper bound of fire times looked at when searching for missed runs.
pub const MAX_MISSED_RUNS: usize = 100;

/// Windows (in seconds) used to look for the latest fire time once [`MAX_MISSED_RUNS`] is
/// exceeded. A window is only searched if the previous one held no fire time, so it holds at most
/// a few bursts of the schedule.
const CATCH_UP_WINDOWS: [i64; 6] = [60, 3_600, 86_400, 32 * 86_400, 367 * 86_400, 5 * 367 * 86_400];

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cron expression {expression:?} has {count} fields, expected 5"))]
    InvalidFieldCount { expression: String, count: usize },

    #[snafu(display("invalid day of week {value:?} in cron expression {expression:?}"))]
    InvalidDayOfWeek { expression: String, value: String },

    #[snafu(display("failed to parse cron expression {expression:?}"))]
    ParseExpression {
        source: cron::error::Error,
        expression: String,
    },
}

/// A parsed cron schedule.
///
/// If both day of month and day of week are restricted, a day matching either one fires (like
/// Kubernetes `CronJob`s do). The `cron` crate requires both to match, so such a schedule is kept
/// as two schedules whose fire times are merged.
#[derive(Clone, Debug)]
pub struct CronSchedule {
    expression: String,
    schedules: Vec<cron::Schedule>,
}

/// The result of looking for fire times that passed since the last run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MissedRun {
    /// The latest fire time that is due.
    pub scheduled_at: Timestamp,

    /// Number of fire times that are due, at most [`MAX_MISSED_RUNS`].
    pub count: usize,

    /// More than [`MAX_MISSED_RUNS`] fire times passed, the controller was probably down for a
    /// while or the clock jumped.
    pub too_many: bool,
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let expression = expression.trim();

        let schedules = to_six_fields(expression)?
            .iter()
            .map(String::as_str)
            .map(cron::Schedule::from_str)
            .collect::<Result<Vec<_>, _>>()
            .context(ParseExpressionSnafu {
                expression: expression.to_owned(),
            })?;

        Ok(Self {
            expression: expression.to_owned(),
            schedules,
        })
    }
}

impl Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

impl CronSchedule {
    /// The first fire time strictly after `after`.
    pub fn next_after(&self, after: Timestamp) -> Option<Timestamp> {
        self.fire_times_after(after).next()
    }

    /// The latest fire time in `(since, now]` along with the number of fire times in that range.
    ///
    /// Returns [`None`] if no fire time passed since `since`.
    pub fn most_recent_missed(&self, since: Timestamp, now: Timestamp) -> Option<MissedRun> {
        let mut latest = None;
        let mut count = 0;

        for fire_time in self.fire_times_after(since) {
            if fire_time > now {
                break;
            }

            if count == MAX_MISSED_RUNS {
                return Some(MissedRun {
                    scheduled_at: self.latest_before(since, now).unwrap_or(fire_time),
                    count,
                    too_many: true,
                });
            }

            latest = Some(fire_time);
            count += 1;
        }

        latest.map(|scheduled_at| MissedRun {
            scheduled_at,
            count,
            too_many: false,
        })
    }

    /// Finds the latest fire time in `(since, now]` without walking every fire time since `since`.
    fn latest_before(&self, since: Timestamp, now: Timestamp) -> Option<Timestamp> {
        for window in CATCH_UP_WINDOWS {
            let start = now
                .checked_sub(SignedDuration::from_secs(window))
                .map_or(since, |start| start.max(since));

            let latest = self
                .fire_times_after(start)
                .take_while(|fire_time| *fire_time <= now)
                .last();

            if latest.is_some() {
                return latest;
            }
        }

        None
    }

    /// All fire times strictly after `after` in ascending order, without duplicates.
    fn fire_times_after(&self, after: Timestamp) -> impl Iterator<Item = Timestamp> + '_ {
        let after = to_chrono(after);
        let mut upcoming: Vec<_> = self
            .schedules
            .iter()
            .map(|schedule| schedule.after(&after).peekable())
            .collect();

        std::iter::from_fn(move || {
            let next = upcoming
                .iter_mut()
                .filter_map(|fire_times| fire_times.peek().copied())
                .min()?;

            // Days matching both halves show up in each of them
            for fire_times in &mut upcoming {
                fire_times.next_if_eq(&next);
            }

            Some(next)
        })
        .filter_map(|fire_time| Timestamp::from_second(fire_time.timestamp()).ok())
    }
}

fn to_chrono(timestamp: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp.as_second(), 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Converts a five field expression into the six field form (with seconds) the `cron` crate
/// expects. Macros are passed through unchanged.
///
/// Returns two expressions if both day of month and day of week are restricted: one for each day
/// field, with the other one set to `*`.
fn to_six_fields(expression: &str) -> Result<Vec<String>, Error> {
    if expression.starts_with('@') {
        return Ok(vec![expression.to_owned()]);
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let &[minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
        return InvalidFieldCountSnafu {
            expression,
            count: fields.len(),
        }
        .fail();
    };

    let converted_day_of_week =
        convert_day_of_week(day_of_week).with_context(|| InvalidDayOfWeekSnafu {
            expression,
            value: day_of_week,
        })?;

    if is_unrestricted(day_of_month) || is_unrestricted(day_of_week) {
        return Ok(vec![format!(
            "0 {minute} {hour} {day_of_month} {month} {converted_day_of_week}"
        )]);
    }

    Ok(vec![
        format!("0 {minute} {hour} {day_of_month} {month} *"),
        format!("0 {minute} {hour} * {month} {converted_day_of_week}"),
    ])
}

/// Whether a day field is a plain wildcard, which makes the other day field decide alone. A
/// stepped wildcard such as `*/2` counts as a restriction.
fn is_unrestricted(field: &str) -> bool {
    matches!(field, "*" | "?")
}

/// Kubernetes counts days of the week from 0 (Sunday) to 6, with 7 as an alias for Sunday. The
/// `cron` crate counts from 1 (Sunday) to 7 (Saturday). Every list item is expanded into the set
/// of days it selects (names included) and the set is emitted as a numeric list.
fn convert_day_of_week(field: &str) -> Option<String> {
    if field == "*" || field == "?" {
        return Some(field.to_owned());
    }

    let mut days = [false; 7];

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, step.parse::<u8>().ok().filter(|s| *s > 0)?),
            None => (item, 1),
        };

        let (start, end) = match range {
            "*" | "?" => (0, 6),
            range => match range.split_once('-') {
                Some((start, end)) => (parse_day(start)?, parse_day(end)?),
                // A single value with a step runs until the end of the week
                None if item.contains('/') => (parse_day(range)?, 6),
                None => {
                    let day = parse_day(range)?;
                    (day, day)
                }
            },
        };

        if start > end {
            return None;
        }

        for day in (start..=end).step_by(usize::from(step)) {
            days[usize::from(day % 7)] = true;
        }
    }

    let converted: Vec<String> = days
        .iter()
        .enumerate()
        .filter(|(_, selected)| **selected)
        .map(|(day, _)| (day + 1).to_string())
        .collect();

    (!converted.is_empty()).then(|| converted.join(","))
}

/// Parses a day of week given as number (0-7) or three letter name.
fn parse_day(value: &str) -> Option<u8> {
    if let Some(index) = DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
    {
        return u8::try_from(index).ok();
    }

    value.parse::<u8>().ok().filter(|day| *day <= 7)
}
