// src/schedule/timespec.rs

//! Timespec strings accepted in `[job.<name>].schedule`.
//!
//! ```text
//! every 30m
//! hourly at 15
//! daily at 4:00        daily 4am
//! weekly on sunday at 3:30
//! ```
//!
//! All times are interpreted in UTC.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeDelta, TimeZone, Timelike, Utc, Weekday};
use regex::Regex;

use crate::errors::{Result, ShieldError};
use crate::schedule::{parse_duration, Schedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timespec {
    /// Fixed interval, measured from the moment the job is rescheduled.
    Every(Duration),
    Hourly { minute: u32 },
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
}

impl Schedule for Timespec {
    fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next = match *self {
            Timespec::Every(interval) => {
                let delta = TimeDelta::from_std(interval)
                    .map_err(|e| ShieldError::Schedule(format!("interval out of range: {e}")))?;
                now.checked_add_signed(delta)
            }
            Timespec::Hourly { minute } => {
                let candidate = at(now.date_naive(), now.hour(), minute)?;
                if candidate > now {
                    Some(candidate)
                } else {
                    candidate.checked_add_signed(TimeDelta::hours(1))
                }
            }
            Timespec::Daily { hour, minute } => {
                let candidate = at(now.date_naive(), hour, minute)?;
                if candidate > now {
                    Some(candidate)
                } else {
                    candidate.checked_add_days(Days::new(1))
                }
            }
            Timespec::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let today = now.weekday().num_days_from_monday();
                let wanted = weekday.num_days_from_monday();
                let ahead = (7 + wanted - today) % 7;
                let date = now
                    .date_naive()
                    .checked_add_days(Days::new(u64::from(ahead)))
                    .ok_or_else(|| exhausted(self))?;
                let candidate = at(date, hour, minute)?;
                if candidate > now {
                    Some(candidate)
                } else {
                    candidate.checked_add_days(Days::new(7))
                }
            }
        };

        match next {
            Some(next) if next > now => Ok(next),
            _ => Err(exhausted(self)),
        }
    }
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> Result<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0).ok_or_else(|| {
        ShieldError::Schedule(format!("invalid time of day {hour:02}:{minute:02}"))
    })?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn exhausted(spec: &Timespec) -> ShieldError {
    ShieldError::Schedule(format!("schedule '{spec}' has no occurrence after now"))
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timespec::Every(d) => write!(f, "every {}s", d.as_secs()),
            Timespec::Hourly { minute } => write!(f, "hourly at {minute}"),
            Timespec::Daily { hour, minute } => write!(f, "daily at {hour}:{minute:02}"),
            Timespec::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly on {} at {hour}:{minute:02}", weekday_name(*weekday)),
        }
    }
}

impl FromStr for Timespec {
    type Err = ShieldError;

    fn from_str(s: &str) -> Result<Self> {
        let spec = s.trim().to_lowercase();
        let spec = spec.split_whitespace().collect::<Vec<_>>().join(" ");

        if let Some(rest) = spec.strip_prefix("every ") {
            let interval = parse_duration(&rest.replace(' ', "")).map_err(|e| invalid(s, &e))?;
            if interval.is_zero() {
                return Err(invalid(s, "interval must be greater than zero"));
            }
            return Ok(Timespec::Every(interval));
        }

        let hourly = compile(r"^hourly (?:at )?:?(\d{1,2})$")?;
        if let Some(caps) = hourly.captures(&spec) {
            let minute = parse_minute(&caps[1]).map_err(|e| invalid(s, &e))?;
            return Ok(Timespec::Hourly { minute });
        }

        let daily = compile(r"^daily (?:at )?(\d{1,2})(?::(\d{2}))? ?(am|pm)?$")?;
        if let Some(caps) = daily.captures(&spec) {
            let (hour, minute) = parse_time_of_day(&caps[1], caps.get(2), caps.get(3))
                .map_err(|e| invalid(s, &e))?;
            return Ok(Timespec::Daily { hour, minute });
        }

        let weekly =
            compile(r"^weekly (?:on )?([a-z]+?)s? (?:at )?(\d{1,2})(?::(\d{2}))? ?(am|pm)?$")?;
        if let Some(caps) = weekly.captures(&spec) {
            let weekday = caps[1]
                .parse::<Weekday>()
                .map_err(|_| invalid(s, &format!("unknown weekday '{}'", &caps[1])))?;
            let (hour, minute) = parse_time_of_day(&caps[2], caps.get(3), caps.get(4))
                .map_err(|e| invalid(s, &e))?;
            return Ok(Timespec::Weekly {
                weekday,
                hour,
                minute,
            });
        }

        Err(invalid(s, "expected 'every', 'hourly', 'daily' or 'weekly'"))
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ShieldError::Other(e.into()))
}

fn invalid(spec: &str, reason: &str) -> ShieldError {
    ShieldError::Schedule(format!("invalid timespec '{spec}': {reason}"))
}

fn parse_minute(raw: &str) -> std::result::Result<u32, String> {
    let minute: u32 = raw
        .parse()
        .map_err(|e| format!("invalid minute '{raw}': {e}"))?;
    if minute > 59 {
        return Err(format!("minute {minute} out of range (0-59)"));
    }
    Ok(minute)
}

fn parse_time_of_day(
    hour: &str,
    minute: Option<regex::Match<'_>>,
    meridiem: Option<regex::Match<'_>>,
) -> std::result::Result<(u32, u32), String> {
    let mut h: u32 = hour
        .parse()
        .map_err(|e| format!("invalid hour '{hour}': {e}"))?;
    let m = match minute {
        Some(m) => parse_minute(m.as_str())?,
        None => 0,
    };

    match meridiem.map(|m| m.as_str()) {
        Some(half) => {
            if !(1..=12).contains(&h) {
                return Err(format!("hour {h} out of range for 12-hour clock"));
            }
            h %= 12;
            if half == "pm" {
                h += 12;
            }
        }
        None if h > 23 => return Err(format!("hour {h} out of range (0-23)")),
        None => {}
    }

    Ok((h, m))
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}
