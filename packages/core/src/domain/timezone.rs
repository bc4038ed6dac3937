//! Calendar-day to send-instant resolution in a user's IANA timezone.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

const SEND_HOUR_LOCAL: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarDay {
    pub month: u32,
    pub day: u32,
}

impl CalendarDay {
    pub fn new(month: u32, day: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (1..=31).contains(&day) {
            Some(Self { month, day })
        } else {
            None
        }
    }

    fn is_feb_29(&self) -> bool {
        self.month == 2 && self.day == 29
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimezoneError {
    #[error("unknown or ambiguous IANA timezone: {0}")]
    InvalidZone(String),

    #[error("{month}/{day} does not exist in year {year}")]
    InvalidDateForYear { month: u32, day: u32, year: i32 },
}

/// Validates an IANA timezone name. Fixed-offset abbreviations (EST, PST,
/// GMT) are rejected even though some resolve via `chrono_tz`'s alias table,
/// because they are ambiguous across regions observing different DST rules.
pub fn validate_zone(name: &str) -> Result<Tz, TimezoneError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || !trimmed.contains('/') {
        return Err(TimezoneError::InvalidZone(name.to_string()));
    }
    trimmed
        .parse::<Tz>()
        .map_err(|_| TimezoneError::InvalidZone(name.to_string()))
}

/// Computes the UTC instant for 09:00 local time on `day`'s occurrence in
/// the current year, in `zone`. 09:00 never falls inside a DST transition
/// window, so this is unambiguous for every IANA zone.
pub fn compute_send_instant(day: CalendarDay, zone: Tz, year: i32) -> Result<DateTime<Utc>, TimezoneError> {
    let naive_date = NaiveDate::from_ymd_opt(year, day.month, day.day).ok_or(
        TimezoneError::InvalidDateForYear {
            month: day.month,
            day: day.day,
            year,
        },
    )?;

    let naive_time = naive_date
        .and_hms_opt(SEND_HOUR_LOCAL, 0, 0)
        .expect("09:00:00 is always a valid time");

    let local = zone
        .from_local_datetime(&naive_time)
        .single()
        .expect("09:00 local never falls in a DST transition gap or overlap");

    Ok(local.with_timezone(&Utc))
}

/// True iff `day` falls on `today` (the current date in `zone`), honoring
/// the Feb 29 -> Feb 28 fallback in non-leap years.
pub fn is_anniversary_today(day: CalendarDay, zone: Tz, now: DateTime<Utc>) -> bool {
    let today = now.with_timezone(&zone).date_naive();

    if today.month() == day.month && today.day() == day.day {
        return true;
    }

    if day.is_feb_29() && today.month() == 2 && today.day() == 28 {
        return !is_leap_year(today.year());
    }

    false
}

pub(crate) fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
