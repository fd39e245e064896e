/// Date parsing for record values and filter boundaries.
///
/// Open-data tables are inconsistent about date formats, so values are run
/// through an ordered list of format parsers and the first one that accepts
/// the input wins. Each parser returns `Option`; the list as a whole returns
/// a tagged `Result` so callers can record why a record was skipped.
///
/// Format priority:
///   1. `YYYY-MM-DD`
///   2. `YYYYMMDD`
///   3. `MM/DD/YYYY`
///   4. `DD/MM/YYYY` (only reached when the US reading is impossible)
///   5. `YYYY-MM` short form (a whole month)
///   6. general timestamps: RFC 3339, `YYYY-MM-DD[T ]HH:MM:SS[.fff]`,
///      `MM/DD/YYYY HH:MM:SS`

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;

use crate::model::Scalar;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized date '{0}'")]
pub struct DateParseError(pub String);

/// Which end of a range a parsed value is being compared against.
/// Only matters for month-granular values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

/// A parsed date value. Short `YYYY-MM` inputs keep their month granularity
/// until a bound is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedDate {
    Day(NaiveDate),
    Month { year: i32, month: u32 },
}

impl ParsedDate {
    /// Concrete date for a comparison: the first day of a short-form month
    /// on the start side, the last day on the end side.
    pub fn resolve(self, bound: Bound) -> NaiveDate {
        match self {
            ParsedDate::Day(date) => date,
            ParsedDate::Month { year, month } => {
                let first = NaiveDate::from_ymd_opt(year, month, 1);
                let last = last_day_of_month(year, month);
                // Both exist: the month was validated when parsed.
                match bound {
                    Bound::Start => first.unwrap_or(NaiveDate::MIN),
                    Bound::End => last.unwrap_or(NaiveDate::MAX),
                }
            }
        }
    }

    /// Whether `date` falls within the value (the whole month for short forms).
    pub fn contains(self, date: NaiveDate) -> bool {
        self.resolve(Bound::Start) <= date && date <= self.resolve(Bound::End)
    }
}

type FormatParser = fn(&str) -> Option<ParsedDate>;

const PARSERS: &[FormatParser] = &[
    parse_iso_day,
    parse_compact_day,
    parse_us_day,
    parse_eu_day,
    parse_year_month,
    parse_timestamp,
];

/// Parses a raw date string using the format priority described above.
pub fn parse_date(raw: &str) -> Result<ParsedDate, DateParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DateParseError(raw.to_string()));
    }
    PARSERS
        .iter()
        .find_map(|parser| parser(trimmed))
        .ok_or_else(|| DateParseError(raw.to_string()))
}

/// Parses a record or condition value. Typed dates pass through, text is
/// parsed, and compact numeric dates such as `20240115` are accepted.
pub fn parse_scalar(value: &Scalar) -> Result<ParsedDate, DateParseError> {
    match value {
        Scalar::Date(date) => Ok(ParsedDate::Day(*date)),
        Scalar::Text(s) => parse_date(s),
        Scalar::Number(n) if n.fract() == 0.0 && *n > 0.0 => parse_date(&format!("{}", *n as i64)),
        other => Err(DateParseError(other.to_string())),
    }
}

/// Parses a range boundary and resolves it to a concrete day.
pub fn resolve_bound(raw: &str, bound: Bound) -> Result<NaiveDate, DateParseError> {
    parse_date(raw).map(|parsed| parsed.resolve(bound))
}

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1).and_then(|d| d.pred_opt())
}

// ---------------------------------------------------------------------------
// Individual format parsers
// ---------------------------------------------------------------------------

fn parse_iso_day(s: &str) -> Option<ParsedDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(ParsedDate::Day)
}

fn parse_compact_day(s: &str) -> Option<ParsedDate> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = s[0..4].parse().ok()?;
    let month = s[4..6].parse().ok()?;
    let day = s[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day).map(ParsedDate::Day)
}

fn parse_us_day(s: &str) -> Option<ParsedDate> {
    NaiveDate::parse_from_str(s, "%m/%d/%Y").ok().map(ParsedDate::Day)
}

fn parse_eu_day(s: &str) -> Option<ParsedDate> {
    NaiveDate::parse_from_str(s, "%d/%m/%Y").ok().map(ParsedDate::Day)
}

fn parse_year_month(s: &str) -> Option<ParsedDate> {
    let (year, month) = s.split_once('-')?;
    if year.len() != 4 || month.is_empty() || month.len() > 2 {
        return None;
    }
    if !year.bytes().all(|b| b.is_ascii_digit()) || !month.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some(ParsedDate::Month { year, month })
}

fn parse_timestamp(s: &str) -> Option<ParsedDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(ParsedDate::Day(dt.date_naive()));
    }
    const TIMESTAMP_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %I:%M:%S %p",
    ];
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| ParsedDate::Day(dt.date()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
