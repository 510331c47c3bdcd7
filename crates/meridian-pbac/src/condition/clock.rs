//! Calendar and time-of-day windows.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use meridian_core::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse, Condition};
use crate::error::{PbacError, PbacResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end: Option<String>,
}

/// A UTC calendar window, start inclusive and end exclusive.
///
/// Bounds are RFC 3339 timestamps or plain `YYYY-MM-DD` dates. A plain end
/// date includes that whole day.
#[derive(Debug, Clone)]
pub struct DateWindow {
    spec: DateSpec,
    from: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

fn parse_instant(s: &str, end: bool) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(ts.and_utc());
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let date = if end { date.succ_opt()? } else { date };
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

impl DateWindow {
    /// Parses `{"start": "2024-01-01", "end": "2024-12-31"}`.
    ///
    /// # Errors
    ///
    /// Returns an error for unparseable bounds.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        let spec: DateSpec = parse("date", value)?;
        let bound = |raw: &Option<String>, end: bool| -> PbacResult<Option<DateTime<Utc>>> {
            raw.as_deref()
                .map(|s| {
                    parse_instant(s, end)
                        .ok_or_else(|| PbacError::invalid_condition("date", format!("invalid date '{s}'")))
                })
                .transpose()
        };
        let from = bound(&spec.start, false)?;
        let until = bound(&spec.end, true)?;
        Ok(Self { spec, from, until })
    }

    /// Returns true if `now` lies in the window.
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| now >= from) && self.until.map_or(true, |until| now < until)
    }
}

impl Condition for DateWindow {
    fn name(&self) -> &'static str {
        "date"
    }

    fn matches(&self, _: &Context) -> bool {
        self.contains(Utc::now())
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(&self.spec).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeSpec {
    start: String,
    end: String,
}

/// A daily window in local time, start inclusive and end exclusive.
///
/// When `end` is before `start` the window wraps past midnight.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    spec: TimeSpec,
    start: u32,
    end: u32,
}

fn seconds_of_day(s: &str) -> Option<u32> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
        .map(|t| t.num_seconds_from_midnight())
}

impl TimeWindow {
    /// Parses `{"start": "22:00", "end": "06:00:00"}`.
    ///
    /// # Errors
    ///
    /// Returns an error for unparseable times.
    pub fn from_value(value: Value) -> PbacResult<Self> {
        let spec: TimeSpec = parse("time", value)?;
        let parse_time = |s: &str| {
            seconds_of_day(s)
                .ok_or_else(|| PbacError::invalid_condition("time", format!("invalid time '{s}'")))
        };
        let start = parse_time(&spec.start)?;
        let end = parse_time(&spec.end)?;
        Ok(Self { spec, start, end })
    }

    /// Returns true if `seconds` after midnight lies in the window.
    #[must_use]
    pub fn contains(&self, seconds: u32) -> bool {
        if self.start <= self.end {
            (self.start..self.end).contains(&seconds)
        } else {
            seconds >= self.start || seconds < self.end
        }
    }

    /// Length of the window.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        let secs = if self.start <= self.end {
            self.end - self.start
        } else {
            86_400 - self.start + self.end
        };
        TimeDelta::seconds(i64::from(secs))
    }
}

impl Condition for TimeWindow {
    fn name(&self) -> &'static str {
        "time"
    }

    fn matches(&self, _: &Context) -> bool {
        self.contains(Local::now().num_seconds_from_midnight())
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(&self.spec).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_date_only_bounds_cover_whole_days() {
        let window = DateWindow::from_value(json!({"start": "2024-03-01", "end": "2024-03-31"})).unwrap();
        assert!(!window.contains(utc("2024-02-29T23:59:59Z")));
        assert!(window.contains(utc("2024-03-01T00:00:00Z")));
        assert!(window.contains(utc("2024-03-31T23:59:59Z")));
        assert!(!window.contains(utc("2024-04-01T00:00:00Z")));
    }

    #[test]
    fn test_date_timestamp_end_exclusive() {
        let window = DateWindow::from_value(json!({"end": "2024-03-01T12:00:00+02:00"})).unwrap();
        assert!(window.contains(utc("2024-03-01T09:59:59Z")));
        assert!(!window.contains(utc("2024-03-01T10:00:00Z")));
    }

    #[test]
    fn test_date_roundtrip_and_errors() {
        let value = json!({"start": "2024-01-01"});
        assert_eq!(DateWindow::from_value(value.clone()).unwrap().to_value(), value);
        assert!(DateWindow::from_value(json!({"start": "yesterday"})).is_err());
        assert!(DateWindow::from_value(json!({"begin": "2024-01-01"})).is_err());
    }

    #[test]
    fn test_time_window() {
        let office = TimeWindow::from_value(json!({"start": "09:00", "end": "17:30"})).unwrap();
        assert!(office.contains(9 * 3600));
        assert!(office.contains(17 * 3600 + 29 * 60));
        assert!(!office.contains(17 * 3600 + 30 * 60));
        assert!(!office.contains(8 * 3600));
        assert_eq!(office.duration(), TimeDelta::minutes(510));
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let night = TimeWindow::from_value(json!({"start": "22:00", "end": "06:00:00"})).unwrap();
        assert!(night.contains(23 * 3600));
        assert!(night.contains(0));
        assert!(night.contains(5 * 3600 + 59 * 60));
        assert!(!night.contains(6 * 3600));
        assert!(!night.contains(12 * 3600));
        assert_eq!(night.duration(), TimeDelta::hours(8));
    }
}
