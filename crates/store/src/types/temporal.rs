//! Temporal values for date search.
//!
//! FHIR date-like elements come in two shapes: point values with an implied
//! precision (`date`, `dateTime`, `instant`) and periods with optional ends.
//! Both are reduced to a half-open [`DateRange`] so that search can compare
//! intervals uniformly.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Lexical lower bound used for open period starts.
pub const RANGE_MIN: &str = "0001-01-01T00:00:00.000Z";

/// Lexical upper bound used for open period ends.
pub const RANGE_MAX: &str = "9999-12-31T23:59:59.999Z";

/// Precision of a FHIR date or dateTime literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatePrecision {
    /// `YYYY`
    Year,
    /// `YYYY-MM`
    Month,
    /// `YYYY-MM-DD`
    Day,
    /// `YYYY-MM-DDThh`
    Hour,
    /// `YYYY-MM-DDThh:mm`
    Minute,
    /// `YYYY-MM-DDThh:mm:ss`
    Second,
    /// `YYYY-MM-DDThh:mm:ss.fff`
    Millisecond,
}

impl fmt::Display for DatePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatePrecision::Year => "year",
            DatePrecision::Month => "month",
            DatePrecision::Day => "day",
            DatePrecision::Hour => "hour",
            DatePrecision::Minute => "minute",
            DatePrecision::Second => "second",
            DatePrecision::Millisecond => "millisecond",
        };
        write!(f, "{}", s)
    }
}

/// Error raised for strings that are not FHIR date literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalError {
    /// The offending input.
    pub input: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl fmt::Display for TemporalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid date '{}': {}", self.input, self.reason)
    }
}

impl std::error::Error for TemporalError {}

/// A point in time together with the precision it was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisePoint {
    /// Earliest instant covered by the literal.
    pub value: DateTime<Utc>,
    /// Precision of the literal.
    pub precision: DatePrecision,
}

impl PrecisePoint {
    /// Parses a FHIR `date`, `dateTime` or `instant` literal.
    ///
    /// Literals without a timezone are read as UTC.
    pub fn parse(input: &str) -> Result<Self, TemporalError> {
        let input = input.trim();
        let err = |reason| TemporalError {
            input: input.to_string(),
            reason,
        };

        let (date_part, time_part) = match input.split_once('T') {
            Some((d, t)) => (d, Some(t)),
            None => (input, None),
        };

        let (date, date_precision) = parse_date_part(date_part).ok_or_else(|| err("bad date"))?;

        let Some(time_part) = time_part else {
            let value = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).ok_or_else(|| err("bad date"))?);
            return Ok(Self {
                value,
                precision: date_precision,
            });
        };
        if date_precision != DatePrecision::Day {
            return Err(err("time requires a full date"));
        }

        let (clock, offset) = split_offset(time_part).ok_or_else(|| err("bad timezone"))?;
        let (h, m, s, nanos, precision) = parse_clock(clock).ok_or_else(|| err("bad time"))?;
        let naive = date
            .and_hms_nano_opt(h, m, s, nanos)
            .ok_or_else(|| err("time out of range"))?;
        let local = offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| err("ambiguous local time"))?;

        Ok(Self {
            value: local.with_timezone(&Utc),
            precision,
        })
    }

    /// Returns the first instant after the span implied by the precision.
    pub fn upper_bound(&self) -> DateTime<Utc> {
        let v = self.value;
        match self.precision {
            DatePrecision::Year => first_of_year(v.year() + 1),
            DatePrecision::Month => {
                if v.month() == 12 {
                    first_of_month(v.year() + 1, 1)
                } else {
                    first_of_month(v.year(), v.month() + 1)
                }
            }
            DatePrecision::Day => v + Duration::days(1),
            DatePrecision::Hour => v + Duration::hours(1),
            DatePrecision::Minute => v + Duration::minutes(1),
            DatePrecision::Second => v + Duration::seconds(1),
            DatePrecision::Millisecond => v + Duration::milliseconds(1),
        }
    }

    /// The half-open range the literal denotes.
    pub fn range(&self) -> DateRange {
        DateRange {
            start: Some(self.value),
            end: Some(self.upper_bound()),
        }
    }
}

/// A date-like element of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalValue {
    /// A `date`, `dateTime` or `instant`.
    Instant(PrecisePoint),
    /// A `Period`; either end may be open.
    Interval {
        /// Period start, if bounded.
        start: Option<PrecisePoint>,
        /// Period end, if bounded. The whole span of its precision is included.
        end: Option<PrecisePoint>,
    },
}

impl TemporalValue {
    /// Reduces the value to the half-open range it covers.
    pub fn to_range(&self) -> DateRange {
        match self {
            TemporalValue::Instant(point) => point.range(),
            TemporalValue::Interval { start, end } => DateRange {
                start: start.map(|p| p.value),
                end: end.map(|p| p.upper_bound()),
            },
        }
    }

    /// The finest precision present in the value, if any end is bounded.
    pub fn precision(&self) -> Option<DatePrecision> {
        match self {
            TemporalValue::Instant(point) => Some(point.precision),
            TemporalValue::Interval { start, end } => {
                match (start.map(|p| p.precision), end.map(|p| p.precision)) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                }
            }
        }
    }
}

/// A half-open interval `[start, end)`; `None` ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Lower bound as fixed-width text suitable for lexical comparison.
    pub fn start_key(&self) -> String {
        self.start.map(format_key).unwrap_or_else(|| RANGE_MIN.to_string())
    }

    /// Upper bound as fixed-width text suitable for lexical comparison.
    pub fn end_key(&self) -> String {
        self.end.map(format_key).unwrap_or_else(|| RANGE_MAX.to_string())
    }

    /// Returns `true` if the two ranges share at least one instant.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start_key() < other.end_key() && other.start_key() < self.end_key()
    }
}

/// Formats an instant as the fixed-width UTC key stored in the index.
pub fn format_key(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn first_of_year(year: i32) -> DateTime<Utc> {
    first_of_month(year, 1)
}

fn first_of_month(year: i32, month: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| Utc.from_utc_datetime(&n))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn parse_date_part(s: &str) -> Option<(NaiveDate, DatePrecision)> {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.first().map(|y| y.len()) != Some(4) {
        return None;
    }
    let year: i32 = parts[0].parse().ok()?;
    match parts.len() {
        1 => Some((NaiveDate::from_ymd_opt(year, 1, 1)?, DatePrecision::Year)),
        2 if parts[1].len() == 2 => {
            let month: u32 = parts[1].parse().ok()?;
            Some((NaiveDate::from_ymd_opt(year, month, 1)?, DatePrecision::Month))
        }
        3 if parts[1].len() == 2 && parts[2].len() == 2 => {
            let month: u32 = parts[1].parse().ok()?;
            let day: u32 = parts[2].parse().ok()?;
            Some((NaiveDate::from_ymd_opt(year, month, day)?, DatePrecision::Day))
        }
        _ => None,
    }
}

fn split_offset(time: &str) -> Option<(&str, FixedOffset)> {
    if let Some(clock) = time.strip_suffix('Z') {
        return Some((clock, FixedOffset::east_opt(0)?));
    }
    match time.rfind(['+', '-']) {
        Some(pos) => {
            let (clock, tz) = time.split_at(pos);
            let sign = if tz.starts_with('-') { -1 } else { 1 };
            let (hh, mm) = tz[1..].split_once(':')?;
            let seconds = hh.parse::<i32>().ok()? * 3600 + mm.parse::<i32>().ok()? * 60;
            Some((clock, FixedOffset::east_opt(sign * seconds)?))
        }
        None => Some((time, FixedOffset::east_opt(0)?)),
    }
}

fn parse_clock(clock: &str) -> Option<(u32, u32, u32, u32, DatePrecision)> {
    let fields: Vec<&str> = clock.split(':').collect();
    let hour: u32 = fields.first()?.parse().ok()?;
    match fields.len() {
        1 => Some((hour, 0, 0, 0, DatePrecision::Hour)),
        2 => Some((hour, fields[1].parse().ok()?, 0, 0, DatePrecision::Minute)),
        3 => {
            let minute: u32 = fields[1].parse().ok()?;
            match fields[2].split_once('.') {
                None => Some((hour, minute, fields[2].parse().ok()?, 0, DatePrecision::Second)),
                Some((sec, frac)) => {
                    if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
                        return None;
                    }
                    let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
                    Some((
                        hour,
                        minute,
                        sec.parse().ok()?,
                        digits.parse().ok()?,
                        DatePrecision::Millisecond,
                    ))
                }
            }
        }
        _ => None,
    }
}
