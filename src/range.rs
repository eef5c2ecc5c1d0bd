// src/range.rs
//! Dashboard date presets. Day boundaries are computed in the caller's time
//! zone; the store works in UTC.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFilter {
    #[default]
    Today,
    Yesterday,
    /// Start of the day seven days ago through the end of today.
    Last7Days,
    ThisMonth,
}

impl FromStr for DateFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "today" => Ok(Self::Today),
            "yesterday" => Ok(Self::Yesterday),
            "last_7_days" | "last7days" | "7d" => Ok(Self::Last7Days),
            "this_month" | "month" => Ok(Self::ThisMonth),
            other => Err(format!("unknown range '{other}'")),
        }
    }
}

/// Inclusive `[start, end]` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateFilter {
    pub fn range_at<Tz: TimeZone>(self, now: DateTime<Tz>) -> TimeRange {
        let tz = now.timezone();
        let today = now.date_naive();
        let (first, last) = match self {
            DateFilter::Today => (today, today),
            DateFilter::Yesterday => {
                let y = today.checked_sub_days(Days::new(1)).unwrap_or(today);
                (y, y)
            }
            DateFilter::Last7Days => (
                today.checked_sub_days(Days::new(7)).unwrap_or(today),
                today,
            ),
            DateFilter::ThisMonth => (today.with_day(1).unwrap_or(today), today),
        };
        TimeRange {
            start: start_of_day(&tz, first),
            end: end_of_day(&tz, last),
        }
    }

    pub fn range_local(self) -> TimeRange {
        self.range_at(chrono::Local::now())
    }
}

fn start_of_day<Tz: TimeZone>(tz: &Tz, day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

fn end_of_day<Tz: TimeZone>(tz: &Tz, day: NaiveDate) -> DateTime<Utc> {
    let t = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
    let naive = day.and_time(t);
    tz.from_local_datetime(&naive)
        .latest()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}
