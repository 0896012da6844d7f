//! When a task fires

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc, Weekday};

use kvshield_core::{KvError, Result};

/// Recurrence of a scheduled task. Calendar schedules are in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period, first fire one period after registration
    Every(Duration),
    /// Once a day at `hour:minute`
    Daily { hour: u32, minute: u32 },
    /// Once a week on `weekday` at `hour:minute`
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Schedule::Every(period)
    }

    pub fn daily(hour: u32, minute: u32) -> Self {
        Schedule::Daily { hour, minute }
    }

    pub fn weekly(weekday: Weekday, hour: u32, minute: u32) -> Self {
        Schedule::Weekly {
            weekday,
            hour,
            minute,
        }
    }

    /// Reject zero periods and out-of-range times
    pub fn validate(&self) -> Result<()> {
        match *self {
            Schedule::Every(period) if period.is_zero() => Err(KvError::Validation(
                "schedule period must be non-zero".into(),
            )),
            Schedule::Daily { hour, minute } | Schedule::Weekly { hour, minute, .. } => {
                time_of_day(hour, minute).map(|_| ())
            }
            Schedule::Every(_) => Ok(()),
        }
    }

    /// First fire strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match *self {
            Schedule::Every(period) => TimeDelta::from_std(period)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta))
                .ok_or_else(|| KvError::Validation(format!("schedule period {period:?} too large"))),
            Schedule::Daily { hour, minute } => {
                let at = time_of_day(hour, minute)?;
                let today = now.date_naive().and_time(at).and_utc();
                Ok(if today > now {
                    today
                } else {
                    today + TimeDelta::days(1)
                })
            }
            Schedule::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let at = time_of_day(hour, minute)?;
                let days_ahead = (7 + weekday.num_days_from_monday()
                    - now.weekday().num_days_from_monday())
                    % 7;
                let candidate = (now.date_naive() + TimeDelta::days(i64::from(days_ahead)))
                    .and_time(at)
                    .and_utc();
                Ok(if candidate > now {
                    candidate
                } else {
                    candidate + TimeDelta::weeks(1)
                })
            }
        }
    }

    /// Wait from `now` until the next fire
    pub fn until_next(&self, now: DateTime<Utc>) -> Result<Duration> {
        if let Schedule::Every(period) = *self {
            return Ok(period);
        }
        let next = self.next_after(now)?;
        Ok((next - now).to_std().unwrap_or_default())
    }
}

fn time_of_day(hour: u32, minute: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| KvError::Validation(format!("invalid time of day {hour:02}:{minute:02}")))
}

fn parse_hhmm(s: &str) -> Result<(u32, u32)> {
    let invalid = || KvError::Validation(format!("expected HH:MM, got {s:?}"));
    let (h, m) = s.split_once(':').ok_or_else(invalid)?;
    let hour = h.parse().map_err(|_| invalid())?;
    let minute = m.parse().map_err(|_| invalid())?;
    time_of_day(hour, minute)?;
    Ok((hour, minute))
}

fn parse_period(s: &str) -> Result<Duration> {
    let invalid = || KvError::Validation(format!("expected a period like 30s, 5m or 2h, got {s:?}"));
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let period = match unit {
        "ms" => Duration::from_millis(n),
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n.saturating_mul(60)),
        "h" => Duration::from_secs(n.saturating_mul(3600)),
        "d" => Duration::from_secs(n.saturating_mul(86400)),
        _ => return Err(invalid()),
    };
    Ok(period)
}

/// Parses `every 30s`, `daily 02:00` and `weekly sun 03:00`.
impl FromStr for Schedule {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let schedule = match parts.as_slice() {
            ["every", period] => Schedule::Every(parse_period(period)?),
            ["daily", at] => {
                let (hour, minute) = parse_hhmm(at)?;
                Schedule::Daily { hour, minute }
            }
            ["weekly", day, at] => {
                let weekday = day
                    .parse::<Weekday>()
                    .map_err(|_| KvError::Validation(format!("unknown weekday {day:?}")))?;
                let (hour, minute) = parse_hhmm(at)?;
                Schedule::Weekly {
                    weekday,
                    hour,
                    minute,
                }
            }
            _ => return Err(KvError::Validation(format!("unrecognized schedule {s:?}"))),
        };
        schedule.validate()?;
        Ok(schedule)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(period) => write!(f, "every {}ms", period.as_millis()),
            Schedule::Daily { hour, minute } => write!(f, "daily {hour:02}:{minute:02}"),
            Schedule::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly {weekday} {hour:02}:{minute:02}"),
        }
    }
}
