/// Core data types for the civic anomaly detection service.
///
/// This module defines the shared domain model imported by all other modules:
/// the loosely-typed input records supplied by the dataset layer, the run
/// metadata that describes one detection run, and the transient and durable
/// forms of an anomaly finding. It contains no I/O.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dates;

/// Both the comparison mean and the recent mean must be strictly greater
/// than this value before a group can be flagged.
pub const NOISE_FLOOR: f64 = 2.0;

/// District recorded in the series key when none can be resolved.
pub const DEFAULT_DISTRICT: i32 = 0;

// ---------------------------------------------------------------------------
// Scalars and records
// ---------------------------------------------------------------------------

/// A single cell value as delivered by the open-data source.
///
/// Deserialized untagged from JSON: `null`, booleans and numbers map
/// directly, ISO `YYYY-MM-DD` strings become `Date`, every other string is
/// `Text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl Scalar {
    pub fn text(value: impl Into<String>) -> Self {
        Scalar::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Numeric view of the value. Text is trimmed and thousands separators
    /// are stripped before parsing, so `"1,234.5"` reads as `1234.5`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) if n.is_finite() => Some(*n),
            Scalar::Text(s) => {
                let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
                if cleaned.is_empty() {
                    return None;
                }
                cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => Ok(()),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

impl From<NaiveDate> for Scalar {
    fn from(value: NaiveDate) -> Self {
        Scalar::Date(value)
    }
}

/// One row of the source table.
///
/// Field names are lowercased once when the record is built; every lookup
/// lowercases the requested name, so upstream keys with inconsistent casing
/// still match. When two keys collide after lowercasing the first one wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Scalar>", into = "BTreeMap<String, Scalar>")]
pub struct Record {
    fields: BTreeMap<String, Scalar>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<Scalar>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut record = Record::new();
        for (key, value) in pairs {
            record.insert(key.as_ref(), value.into());
        }
        record
    }

    /// Inserts a field unless a field with the same case-folded name exists.
    /// Returns `false` on a collision.
    pub fn insert(&mut self, name: &str, value: Scalar) -> bool {
        let key = name.to_lowercase();
        if self.fields.contains_key(&key) {
            tracing::debug!(field = name, "duplicate field after case folding; keeping first value");
            return false;
        }
        self.fields.insert(key, value);
        true
    }

    /// Case-insensitive field lookup. `None` means the field is absent.
    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<BTreeMap<String, Scalar>> for Record {
    fn from(map: BTreeMap<String, Scalar>) -> Self {
        let mut record = Record::new();
        for (key, value) in map {
            record.insert(&key, value);
        }
        record
    }
}

impl From<Record> for BTreeMap<String, Scalar> {
    fn from(record: Record) -> Self {
        record.fields
    }
}

// ---------------------------------------------------------------------------
// Filter conditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl Operator {
    pub fn is_relational(self) -> bool {
        !matches!(self, Operator::Eq | Operator::Ne)
    }

    /// Applies the operator to an already-computed ordering of
    /// `record_value` relative to `condition_value`.
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Operator::Eq => ordering == Equal,
            Operator::Ne => ordering != Equal,
            Operator::Lt => ordering == Less,
            Operator::Le => ordering != Greater,
            Operator::Gt => ordering == Greater,
            Operator::Ge => ordering != Less,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        };
        f.write_str(symbol)
    }
}

/// A single `field operator value` predicate applied by the data filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: Operator,
    pub value: Scalar,
    #[serde(default)]
    pub is_date: bool,
}

impl FilterCondition {
    pub fn new(field: &str, operator: Operator, value: impl Into<Scalar>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value: value.into(),
            is_date: false,
        }
    }

    pub fn date(field: &str, operator: Operator, value: &str) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value: Scalar::text(value),
            is_date: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Periods
// ---------------------------------------------------------------------------

/// Bucket granularity for a detection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    #[default]
    Month,
    Year,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Month => "month",
            PeriodType::Year => "year",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeriodType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "month" => Ok(PeriodType::Month),
            "year" => Ok(PeriodType::Year),
            other => Err(format!("unknown period type '{}'", other)),
        }
    }
}

/// Aggregation bucket label. Ordering is chronological within a
/// granularity; `All` is the single bucket used when a run has no date field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeriodKey {
    Month { year: i32, month: u32 },
    Year(i32),
    All,
}

impl PeriodKey {
    pub fn for_date(date: NaiveDate, period_type: PeriodType) -> Self {
        match period_type {
            PeriodType::Month => PeriodKey::Month {
                year: date.year(),
                month: date.month(),
            },
            PeriodType::Year => PeriodKey::Year(date.year()),
        }
    }

    /// The following bucket of the same granularity. `All` has no successor.
    pub fn next(self) -> Option<Self> {
        match self {
            PeriodKey::Month { year, month: 12 } => Some(PeriodKey::Month {
                year: year + 1,
                month: 1,
            }),
            PeriodKey::Month { year, month } => Some(PeriodKey::Month {
                year,
                month: month + 1,
            }),
            PeriodKey::Year(year) => Some(PeriodKey::Year(year + 1)),
            PeriodKey::All => None,
        }
    }

    pub fn first_day(self) -> Option<NaiveDate> {
        match self {
            PeriodKey::Month { year, month } => NaiveDate::from_ymd_opt(year, month, 1),
            PeriodKey::Year(year) => NaiveDate::from_ymd_opt(year, 1, 1),
            PeriodKey::All => None,
        }
    }

    pub fn last_day(self) -> Option<NaiveDate> {
        match self {
            PeriodKey::Month { year, month } => dates::last_day_of_month(year, month),
            PeriodKey::Year(year) => NaiveDate::from_ymd_opt(year, 12, 31),
            PeriodKey::All => None,
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodKey::Month { year, month } => write!(f, "{:04}-{:02}", year, month),
            PeriodKey::Year(year) => write!(f, "{:04}", year),
            PeriodKey::All => f.write_str("all"),
        }
    }
}

impl std::str::FromStr for PeriodKey {
    type Err = String;

    /// Inverse of `Display`: `YYYY-MM`, `YYYY` or `all`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid period key '{}'", s);
        if s == "all" {
            return Ok(PeriodKey::All);
        }
        match s.split_once('-') {
            Some((year, month)) => {
                let year: i32 = year.parse().map_err(|_| invalid())?;
                let month: u32 = month.parse().map_err(|_| invalid())?;
                if !(1..=12).contains(&month) {
                    return Err(invalid());
                }
                Ok(PeriodKey::Month { year, month })
            }
            None => s.parse::<i32>().map(PeriodKey::Year).map_err(|_| invalid()),
        }
    }
}

/// An inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Whether a bucket falls inside this period at the given granularity.
    /// Buckets are compared by their truncated keys, so a month partly
    /// covered by the period counts as inside. `All` is never inside.
    pub fn covers(&self, key: PeriodKey, period_type: PeriodType) -> bool {
        if key == PeriodKey::All {
            return false;
        }
        PeriodKey::for_date(self.start, period_type) <= key
            && key <= PeriodKey::for_date(self.end, period_type)
    }

    pub fn label(&self) -> String {
        format!("{} to {}", self.start.format("%Y-%m-%d"), self.end.format("%Y-%m-%d"))
    }
}

// ---------------------------------------------------------------------------
// Run metadata and series identity
// ---------------------------------------------------------------------------

/// Everything the caller tells the engine about one detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub object_type: String,
    pub object_id: String,
    pub object_name: String,
    pub group_field: String,
    #[serde(default)]
    pub date_field: Option<String>,
    /// Field summed per bucket. `None` counts records instead.
    #[serde(default)]
    pub numeric_field: Option<String>,
    #[serde(default)]
    pub period_type: PeriodType,
    #[serde(default)]
    pub y_axis_label: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub filter_conditions: Vec<FilterCondition>,
    pub recent_period: Period,
    pub comparison_period: Period,
    #[serde(default)]
    pub district: Option<String>,
}

impl RunMetadata {
    /// District for the series key: the explicit `district` value, else an
    /// equality filter on a `*district*` field, else `DEFAULT_DISTRICT`.
    pub fn resolve_district(&self) -> i32 {
        if let Some(district) = self.district.as_deref().and_then(parse_district) {
            return district;
        }
        self.filter_conditions
            .iter()
            .filter(|c| c.operator == Operator::Eq && c.field.to_lowercase().contains("district"))
            .find_map(|c| parse_district(&c.value.to_string()))
            .unwrap_or(DEFAULT_DISTRICT)
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            object_type: self.object_type.clone(),
            object_id: self.object_id.clone(),
            object_name: self.object_name.clone(),
            group_field: self.group_field.clone(),
            period_type: self.period_type,
            district: self.resolve_district(),
        }
    }

    /// Label used in log lines and captions.
    pub fn display_name(&self) -> &str {
        if !self.title.is_empty() {
            &self.title
        } else if !self.object_name.is_empty() {
            &self.object_name
        } else {
            &self.object_id
        }
    }
}

fn parse_district(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    trimmed.parse::<i32>().ok().or_else(|| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|f| f.fract() == 0.0 && f.abs() < i32::MAX as f64)
            .map(|f| f as i32)
    })
}

/// Identity of a logical anomaly series. At most one batch of rows per key
/// is active at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub object_type: String,
    pub object_id: String,
    pub object_name: String,
    pub group_field: String,
    pub period_type: PeriodType,
    pub district: i32,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}",
            self.object_type,
            self.object_id,
            self.object_name,
            self.group_field,
            self.period_type,
            self.district
        )
    }
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// Comparator output for one group in one run.
///
/// `dates`/`counts` hold every densified bucket of the group in
/// chronological order, including buckets outside both periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub group_value: String,
    pub comparison_mean: f64,
    pub recent_mean: f64,
    pub difference: f64,
    pub std_dev: f64,
    pub out_of_bounds: bool,
    pub dates: Vec<String>,
    pub counts: Vec<f64>,
}

/// A persisted anomaly row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: i64,
    pub group_value: String,
    pub group_field_name: String,
    pub period_type: PeriodType,
    pub object_type: String,
    pub object_id: String,
    pub object_name: String,
    pub district: i32,
    pub comparison_mean: f64,
    pub recent_mean: f64,
    pub difference: f64,
    pub std_dev: f64,
    pub out_of_bounds: bool,
    pub comparison_dates: Vec<String>,
    pub comparison_counts: Vec<f64>,
    pub recent_dates: Vec<String>,
    pub recent_counts: Vec<f64>,
    pub metadata: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl AnomalyRecord {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            object_type: self.object_type.clone(),
            object_id: self.object_id.clone(),
            object_name: self.object_name.clone(),
            group_field: self.group_field_name.clone(),
            period_type: self.period_type,
            district: self.district,
        }
    }

    /// Metadata string field, empty when missing.
    pub fn metadata_str(&self, key: &str) -> &str {
        self.metadata.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Per-record errors
// ---------------------------------------------------------------------------

/// Problems with a single record. These are recorded in a skip log and
/// never abort a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("missing field '{0}'")]
    MissingField(String),
    #[error("invalid date '{value}' in field '{field}'")]
    InvalidDate { field: String, value: String },
    #[error("values not comparable: '{field}' {operator} {value}")]
    NotComparable {
        field: String,
        operator: Operator,
        value: String,
    },
}

impl RecordError {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordError::MissingField(_) => "missing_field",
            RecordError::InvalidDate { .. } => "invalid_date",
            RecordError::NotComparable { .. } => "not_comparable",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
