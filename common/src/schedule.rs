use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone};
use chrono_tz::Tz;
use cron::Schedule;
use std::fmt;
use std::str::FromStr;

const SHORTHANDS: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

/// A standard 5-field cron expression (minute, hour, day-of-month, month,
/// day-of-week).
///
/// The `cron` crate works with a leading seconds field and numbers weekdays
/// 1-7 starting on Sunday, so each expression is translated before it is
/// handed over. When both day-of-month and day-of-week are restricted a day
/// matches if *either* field matches, which needs two underlying schedules.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedules: Vec<Schedule>,
}

impl CronExpr {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `from`, evaluated in `from`'s timezone.
    pub fn next_after<Z: TimeZone>(&self, from: &DateTime<Z>) -> Option<DateTime<Z>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(from).find(|t| t > from))
            .min()
    }

    pub fn upcoming<Z: TimeZone>(&self, from: &DateTime<Z>, count: usize) -> Vec<DateTime<Z>> {
        let mut fires = Vec::with_capacity(count);
        let mut cursor = from.clone();
        while fires.len() < count {
            match self.next_after(&cursor) {
                Some(next) => {
                    cursor = next.clone();
                    fires.push(next);
                }
                None => break,
            }
        }
        fires
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_cron(s)
    }
}

pub fn parse_cron(expression: &str) -> Result<CronExpr> {
    let trimmed = expression.trim();
    let expanded = if trimmed.starts_with('@') {
        SHORTHANDS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(trimmed))
            .map(|(_, fields)| *fields)
            .ok_or_else(|| Error::scheduling(expression, "unknown shorthand"))?
    } else {
        trimmed
    };

    let fields: Vec<&str> = expanded.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::scheduling(
            expression,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }
    let (minute, hour, day_of_month, month, day_of_week) =
        (fields[0], fields[1], fields[2], fields[3], fields[4]);

    let weekdays = translate_day_of_week(day_of_week).map_err(|r| Error::scheduling(expression, r))?;
    let day_of_month = if day_of_month == "?" { "*" } else { day_of_month };

    let variants = if is_restricted(day_of_month) && is_restricted(day_of_week) {
        vec![(day_of_month, "*".to_string()), ("*", weekdays)]
    } else {
        vec![(day_of_month, weekdays)]
    };

    let schedules = variants
        .into_iter()
        .map(|(dom, dow)| {
            let with_seconds = format!("0 {} {} {} {} {}", minute, hour, dom, month, dow);
            Schedule::from_str(&with_seconds).map_err(|e| Error::scheduling(expression, e))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CronExpr {
        source: trimmed.to_string(),
        schedules,
    })
}

/// Next fire time of `expression` strictly after `from`.
pub fn compute_next_fire<Z: TimeZone>(expression: &str, from: &DateTime<Z>) -> Result<DateTime<Z>> {
    parse_cron(expression)?
        .next_after(from)
        .ok_or_else(|| Error::scheduling(expression, "expression has no upcoming fire time"))
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| Error::config(format!("unknown timezone '{}': {}", name, e)))
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

/// Rewrites a standard day-of-week field (0-7, Sunday = 0 or 7, names
/// SUN-SAT) as an explicit list in the `cron` crate's 1-7 numbering.
fn translate_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("invalid step '{}'", step))?;
                (range, step)
            }
            None => (item, 1),
        };
        if step == 0 {
            return Err(format!("step must be positive in '{}'", item));
        }

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (weekday(a)?, weekday(b)?)
        } else if item.contains('/') {
            (weekday(range)?, 7)
        } else {
            let day = weekday(range)?;
            (day, day)
        };
        if start > end {
            return Err(format!("day-of-week range '{}' runs backwards", range));
        }

        for day in (start..=end).step_by(step as usize) {
            days[(day % 7) as usize] = true;
        }
    }

    let list: Vec<String> = (0..7)
        .filter(|d| days[*d])
        .map(|d| (d + 1).to_string())
        .collect();
    Ok(list.join(","))
}

fn weekday(token: &str) -> std::result::Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day-of-week {} out of range 0-7", n))
        };
    }
    match token.to_lowercase().as_str() {
        "sun" => Ok(0),
        "mon" => Ok(1),
        "tue" => Ok(2),
        "wed" => Ok(3),
        "thu" => Ok(4),
        "fri" => Ok(5),
        "sat" => Ok(6),
        _ => Err(format!("invalid weekday '{}'", token)),
    }
}
