//! Epoch-millisecond helpers.
//!
//! Funding times and futures samples are epoch milliseconds UTC; everything
//! calendar-related in the crate goes through these functions.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Convert epoch milliseconds to a UTC datetime.
pub fn datetime_of_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

/// UTC calendar day of an epoch-millisecond timestamp.
pub fn day_of_millis(millis: i64) -> Option<NaiveDate> {
    datetime_of_millis(millis).map(|dt| dt.date_naive())
}

/// Format as `YYYYMMDDHHMMSS`, the compact form used in funding CSV files.
pub fn format_compact(millis: i64) -> Option<String> {
    datetime_of_millis(millis).map(|dt| dt.format("%Y%m%d%H%M%S").to_string())
}

/// Parse `YYYYMMDDHHMMSS` or `YYYY-MM-DD` into epoch milliseconds UTC.
///
/// A bare date resolves to midnight.
pub fn parse_time_arg(s: &str) -> Result<i64> {
    let s = s.trim();
    let naive = if s.len() == 14 && s.chars().all(|c| c.is_ascii_digit()) {
        NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S")
            .with_context(|| format!("Invalid time '{}', expected YYYYMMDDHHMMSS", s))?
    } else {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))?
            .and_hms_opt(0, 0, 0)
            .context("Invalid midnight")?
    };
    Ok(naive.and_utc().timestamp_millis())
}

/// Parse a `YYYY-MM-DD` or `YYYYMMDD` calendar day.
pub fn parse_day(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))
}

/// Inclusive iterator over calendar days.
pub fn days_between(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d <= end)
}
