//! Fixed-offset ledger calendar.
//!
//! Ledger dates never depend on the host time zone: an instant is mapped to a
//! calendar date in UTC+9, and year-month keys are derived from that date.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::macros::{format_description, offset};
use time::{Date, Duration, Month, OffsetDateTime, UtcOffset, Weekday};

use crate::models::HolidayAdjustment;

pub const LOCAL_OFFSET: UtcOffset = offset!(+9);

/// Calendar date of `instant` in the ledger offset.
pub fn local_date(instant: OffsetDateTime) -> Date {
    instant.to_offset(LOCAL_OFFSET).date()
}

/// Start of `date` in the ledger offset, as a UTC instant.
pub fn local_midnight(date: Date) -> OffsetDateTime {
    to_utc(date.midnight().assume_offset(LOCAL_OFFSET))
}

/// Instants are held in UTC so a row serializes the same before and after a
/// round trip through the store.
pub fn to_utc(instant: OffsetDateTime) -> OffsetDateTime {
    instant.to_offset(UtcOffset::UTC)
}

pub fn format_instant(instant: OffsetDateTime) -> anyhow::Result<String> {
    Ok(instant.to_offset(UtcOffset::UTC).format(&Rfc3339)?)
}

pub fn parse_instant(value: &str) -> anyhow::Result<OffsetDateTime> {
    Ok(OffsetDateTime::parse(value, &Rfc3339)?)
}

pub fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

pub fn parse_date(value: &str) -> anyhow::Result<Date> {
    Ok(Date::parse(value, format_description!("[year]-[month]-[day]"))?)
}

pub fn days_in_month(year: i32, month: Month) -> u8 {
    let (next_year, next_month) = match month {
        Month::December => (year + 1, Month::January),
        other => (year, other.next()),
    };
    match Date::from_calendar_date(next_year, next_month, 1) {
        Ok(first_of_next) => (first_of_next - Duration::days(1)).day(),
        // Only reachable at the edge of the supported year range.
        Err(_) => 31,
    }
}

pub fn is_weekend(date: Date) -> bool {
    matches!(date.weekday(), Weekday::Saturday | Weekday::Sunday)
}

/// Moves a weekend date to the adjacent business day according to `policy`.
pub fn shift_for_holiday(date: Date, policy: HolidayAdjustment) -> Date {
    match (policy, date.weekday()) {
        (HolidayAdjustment::Previous, Weekday::Saturday) => date - Duration::days(1),
        (HolidayAdjustment::Previous, Weekday::Sunday) => date - Duration::days(2),
        (HolidayAdjustment::Next, Weekday::Saturday) => date + Duration::days(2),
        (HolidayAdjustment::Next, Weekday::Sunday) => date + Duration::days(1),
        _ => date,
    }
}

/// Serde adapter for `YYYY-MM-DD` dates.
pub mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }
}

/// A calendar month key, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u8,
}

impl YearMonth {
    pub fn new(year: i32, month: Month) -> Self {
        Self {
            year,
            month: u8::from(month),
        }
    }

    pub fn from_date(date: Date) -> Self {
        Self::new(date.year(), date.month())
    }

    /// Month containing `instant` in the ledger offset.
    pub fn from_instant(instant: OffsetDateTime) -> Self {
        Self::from_date(local_date(instant))
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> Month {
        Month::try_from(self.month).unwrap_or(Month::January)
    }

    pub fn first_day(&self) -> Date {
        Date::from_calendar_date(self.year, self.month(), 1).unwrap_or(Date::MIN)
    }

    pub fn last_day(&self) -> Date {
        let last = days_in_month(self.year, self.month());
        Date::from_calendar_date(self.year, self.month(), last).unwrap_or(Date::MAX)
    }

    pub fn prev(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Signed number of months from `earlier` to `self`.
    pub fn months_since(&self, earlier: YearMonth) -> i32 {
        (self.year - earlier.year) * 12 + (i32::from(self.month) - i32::from(earlier.month))
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("Invalid year-month '{}', expected YYYY-MM", value);
        let (year, month) = value.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        let month = Month::try_from(month).map_err(|_| invalid())?;
        Ok(Self::new(year, month))
    }
}

impl TryFrom<String> for YearMonth {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}
