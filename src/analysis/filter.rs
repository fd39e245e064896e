/// Record filtering by date window and field conditions.
///
/// Every condition is checked against every record. A record that lacks a
/// referenced field, carries an unparseable date, or asks for a relational
/// comparison between incomparable values is skipped and counted; it is
/// never an error for the run. Only a malformed *condition* (for example a
/// date condition whose value is not a date) rejects the whole filter.

use std::cmp::Ordering;

use chrono::NaiveDate;
use thiserror::Error;

use crate::analysis::SkipLog;
use crate::dates::{self, Bound, DateParseError, ParsedDate};
use crate::logging;
use crate::model::{FilterCondition, Operator, Period, Record, RecordError, Scalar};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("filter condition on '{field}' has invalid date value: {source}")]
    InvalidCondition {
        field: String,
        #[source]
        source: DateParseError,
    },
    #[error("invalid date window bound: {0}")]
    InvalidBound(#[from] DateParseError),
}

/// Inclusive date range applied to one field. Either side may be open.
#[derive(Debug, Clone, PartialEq)]
pub struct DateWindow {
    pub field: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateWindow {
    /// Builds a window from raw boundary strings. A `YYYY-MM` start becomes
    /// the first day of that month and a `YYYY-MM` end the last day.
    pub fn parse(field: &str, start: Option<&str>, end: Option<&str>) -> Result<Self, FilterError> {
        Ok(Self {
            field: field.to_string(),
            start: start.map(|s| dates::resolve_bound(s, Bound::Start)).transpose()?,
            end: end.map(|s| dates::resolve_bound(s, Bound::End)).transpose()?,
        })
    }

    /// The full analysis range of a run: comparison start to recent end.
    pub fn spanning(field: &str, comparison: &Period, recent: &Period) -> Self {
        Self {
            field: field.to_string(),
            start: Some(comparison.start.min(recent.start)),
            end: Some(recent.end.max(comparison.end)),
        }
    }

    fn admits(&self, date: NaiveDate) -> bool {
        self.start.is_none_or(|s| date >= s) && self.end.is_none_or(|e| date <= e)
    }
}

/// Result of filtering one batch of records.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub records: Vec<Record>,
    pub total: usize,
    /// Records that were evaluated cleanly but did not match.
    pub excluded: usize,
    pub skips: SkipLog,
}

impl FilterOutcome {
    pub fn retained(&self) -> usize {
        self.records.len()
    }

    pub fn skipped(&self) -> usize {
        self.skips.total()
    }
}

// ---------------------------------------------------------------------------
// Condition compilation
// ---------------------------------------------------------------------------

enum Target {
    Date(ParsedDate),
    Value(Scalar),
}

struct CompiledCondition<'a> {
    field: &'a str,
    operator: Operator,
    target: Target,
}

fn compile(conditions: &[FilterCondition]) -> Result<Vec<CompiledCondition<'_>>, FilterError> {
    conditions
        .iter()
        .map(|c| {
            let target = if c.is_date {
                let parsed = dates::parse_scalar(&c.value).map_err(|source| FilterError::InvalidCondition {
                    field: c.field.clone(),
                    source,
                })?;
                Target::Date(parsed)
            } else {
                Target::Value(c.value.clone())
            };
            Ok(CompiledCondition {
                field: &c.field,
                operator: c.operator,
                target,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

/// Applies `window` and every condition to `records`.
pub fn filter_records(
    records: Vec<Record>,
    conditions: &[FilterCondition],
    window: Option<&DateWindow>,
) -> Result<FilterOutcome, FilterError> {
    filter_records_with_log(records, conditions, window, SkipLog::default())
}

/// Same as `filter_records`, accumulating into a caller-provided skip log.
pub fn filter_records_with_log(
    records: Vec<Record>,
    conditions: &[FilterCondition],
    window: Option<&DateWindow>,
    mut skips: SkipLog,
) -> Result<FilterOutcome, FilterError> {
    let compiled = compile(conditions)?;
    let total = records.len();
    let mut retained = Vec::with_capacity(total);
    let mut excluded = 0;

    for (index, record) in records.into_iter().enumerate() {
        match evaluate(&record, &compiled, window) {
            Ok(true) => retained.push(record),
            Ok(false) => excluded += 1,
            Err(e) => skips.record(index, e),
        }
    }

    let outcome = FilterOutcome {
        records: retained,
        total,
        excluded,
        skips,
    };
    logging::log_filter_summary(&outcome);
    Ok(outcome)
}

fn evaluate(
    record: &Record,
    conditions: &[CompiledCondition<'_>],
    window: Option<&DateWindow>,
) -> Result<bool, RecordError> {
    if let Some(window) = window {
        let date = record_date(record, &window.field)?;
        if !window.admits(date) {
            return Ok(false);
        }
    }

    for condition in conditions {
        if !matches_condition(record, condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn field_value<'r>(record: &'r Record, field: &str) -> Result<&'r Scalar, RecordError> {
    match record.get(field) {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(RecordError::MissingField(field.to_string())),
    }
}

/// Reads and parses a date field. Short-form months resolve to their first day.
pub(crate) fn record_date(record: &Record, field: &str) -> Result<NaiveDate, RecordError> {
    let value = field_value(record, field)?;
    dates::parse_scalar(value)
        .map(|parsed| parsed.resolve(Bound::Start))
        .map_err(|_| RecordError::InvalidDate {
            field: field.to_string(),
            value: value.to_string(),
        })
}

fn matches_condition(record: &Record, condition: &CompiledCondition<'_>) -> Result<bool, RecordError> {
    match &condition.target {
        Target::Date(target) => {
            let date = record_date(record, condition.field)?;
            Ok(compare_date(date, condition.operator, *target))
        }
        Target::Value(target) => {
            let value = field_value(record, condition.field)?;
            compare_values(value, condition.operator, target).ok_or_else(|| RecordError::NotComparable {
                field: condition.field.to_string(),
                operator: condition.operator,
                value: target.to_string(),
            })
        }
    }
}

/// Month-granular targets: `>=`/`<` use the first day of the month,
/// `<=`/`>` the last day, and `==`/`!=` test membership in the month.
fn compare_date(date: NaiveDate, operator: Operator, target: ParsedDate) -> bool {
    match operator {
        Operator::Eq => target.contains(date),
        Operator::Ne => !target.contains(date),
        Operator::Ge | Operator::Lt => operator.holds(date.cmp(&target.resolve(Bound::Start))),
        Operator::Le | Operator::Gt => operator.holds(date.cmp(&target.resolve(Bound::End))),
    }
}

/// Numeric comparison when both sides read as numbers, date comparison
/// when both read as dates, raw equality otherwise. `None` means a
/// relational operator was applied to incomparable values.
fn compare_values(value: &Scalar, operator: Operator, target: &Scalar) -> Option<bool> {
    if let (Some(a), Some(b)) = (value.as_number(), target.as_number()) {
        let ordering = a.partial_cmp(&b)?;
        return Some(operator.holds(ordering));
    }
    if let (Ok(a), Ok(b)) = (dates::parse_scalar(value), dates::parse_scalar(target)) {
        return Some(compare_date(a.resolve(Bound::Start), operator, b));
    }
    if operator.is_relational() {
        return None;
    }
    let ordering = if value.to_string() == target.to_string() {
        Ordering::Equal
    } else {
        Ordering::Less
    };
    Some(operator.holds(ordering))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn incident(neighborhood: &str, date: &str, count: &str) -> Record {
        Record::from_pairs([
            ("Analysis_Neighborhood", Scalar::text(neighborhood)),
            ("Report_Date", Scalar::text(date)),
            ("Incident_Count", Scalar::text(count)),
        ])
    }

    #[test]
    fn test_missing_field_is_skipped_and_counted() {
        let records = vec![
            incident("Mission", "2024-01-05", "3"),
            Record::from_pairs([("analysis_neighborhood", "Mission")]),
        ];
        let conditions = [FilterCondition::new("incident_count", Operator::Gt, 1.0)];
        let outcome = filter_records(records, &conditions, None).unwrap();

        assert_eq!(outcome.total, 2);
        assert_eq!(outcome.retained(), 1);
        assert_eq!(outcome.skipped(), 1);
        assert_eq!(outcome.skips.count("missing_field"), 1);
    }

    #[test]
    fn test_field_names_match_case_insensitively() {
        let records = vec![incident("Mission", "2024-01-05", "3")];
        let conditions = [FilterCondition::new("ANALYSIS_NEIGHBORHOOD", Operator::Eq, "Mission")];
        let outcome = filter_records(records, &conditions, None).unwrap();
        assert_eq!(outcome.retained(), 1);
    }

    #[test]
    fn test_relational_on_text_is_not_comparable() {
        let records = vec![incident("Mission", "2024-01-05", "3")];
        let conditions = [FilterCondition::new("analysis_neighborhood", Operator::Gt, "Bayview")];
        let outcome = filter_records(records, &conditions, None).unwrap();

        assert_eq!(outcome.retained(), 0);
        assert_eq!(outcome.excluded, 0);
        assert_eq!(outcome.skips.count("not_comparable"), 1);
    }

    #[test]
    fn test_equality_on_raw_text_values() {
        let records = vec![
            incident("Mission", "2024-01-05", "3"),
            incident("Bayview", "2024-01-05", "3"),
        ];
        let conditions = [FilterCondition::new("analysis_neighborhood", Operator::Ne, "Mission")];
        let outcome = filter_records(records, &conditions, None).unwrap();

        assert_eq!(outcome.retained(), 1);
        assert_eq!(outcome.excluded, 1);
        assert_eq!(outcome.records[0].get("analysis_neighborhood"), Some(&Scalar::text("Bayview")));
    }

    #[test]
    fn test_numeric_comparison_strips_thousands_separators() {
        let records = vec![
            incident("Mission", "2024-01-05", "1,250"),
            incident("Bayview", "2024-01-05", "999"),
        ];
        let conditions = [FilterCondition::new("incident_count", Operator::Ge, "1,000")];
        let outcome = filter_records(records, &conditions, None).unwrap();
        assert_eq!(outcome.retained(), 1);
        assert_eq!(outcome.records[0].get("incident_count"), Some(&Scalar::text("1,250")));
    }

    #[test]
    fn test_date_window_with_mixed_record_formats() {
        let records = vec![
            incident("A", "2023-12-31", "1"),
            incident("B", "20240101", "1"),
            incident("C", "01/31/2024", "1"),
            incident("D", "2024-02-01T00:00:00.000", "1"),
            incident("E", "someday", "1"),
        ];
        let window = DateWindow::parse("report_date", Some("2024-01"), Some("2024-01")).unwrap();
        let outcome = filter_records(records, &[], Some(&window)).unwrap();

        assert_eq!(outcome.retained(), 2);
        assert_eq!(outcome.excluded, 2);
        assert_eq!(outcome.skips.count("invalid_date"), 1);
    }

    #[test]
    fn test_short_form_end_condition_includes_whole_month() {
        let records = vec![
            incident("A", "2024-01-31", "1"),
            incident("B", "2024-02-01", "1"),
        ];
        let conditions = [FilterCondition::date("report_date", Operator::Le, "2024-01")];
        let outcome = filter_records(records, &conditions, None).unwrap();

        assert_eq!(outcome.retained(), 1);
        assert_eq!(outcome.records[0].get("analysis_neighborhood"), Some(&Scalar::text("A")));
    }

    #[test]
    fn test_short_form_start_conditions_use_first_day() {
        let records = vec![
            incident("A", "2023-12-31", "1"),
            incident("B", "2024-01-01", "1"),
        ];
        let ge = [FilterCondition::date("report_date", Operator::Ge, "2024-01")];
        let outcome = filter_records(records.clone(), &ge, None).unwrap();
        assert_eq!(outcome.retained(), 1);

        let lt = [FilterCondition::date("report_date", Operator::Lt, "2024-01")];
        let outcome = filter_records(records, &lt, None).unwrap();
        assert_eq!(outcome.retained(), 1);
        assert_eq!(outcome.records[0].get("analysis_neighborhood"), Some(&Scalar::text("A")));
    }

    #[test]
    fn test_short_form_equality_matches_month() {
        let records = vec![
            incident("A", "2024-01-01", "1"),
            incident("B", "2024-01-31", "1"),
            incident("C", "2024-02-01", "1"),
        ];
        let conditions = [FilterCondition::date("report_date", Operator::Eq, "2024-01")];
        let outcome = filter_records(records, &conditions, None).unwrap();
        assert_eq!(outcome.retained(), 2);
    }

    #[test]
    fn test_invalid_date_condition_rejects_filter() {
        let conditions = [FilterCondition::date("report_date", Operator::Ge, "last tuesday")];
        let result = filter_records(vec![], &conditions, None);
        assert!(matches!(result, Err(FilterError::InvalidCondition { .. })));
    }

    #[test]
    fn test_window_spanning_periods() {
        let comparison = Period::new(ymd(2023, 1, 1), ymd(2023, 12, 31));
        let recent = Period::new(ymd(2024, 1, 1), ymd(2024, 1, 31));
        let window = DateWindow::spanning("report_date", &comparison, &recent);
        assert_eq!(window.start, Some(ymd(2023, 1, 1)));
        assert_eq!(window.end, Some(ymd(2024, 1, 31)));
    }

    #[test]
    fn test_typed_date_values_compare_without_is_date_flag() {
        let records = vec![Record::from_pairs([("report_date", Scalar::Date(ymd(2024, 3, 1)))])];
        let conditions = [FilterCondition::new("report_date", Operator::Gt, "2024-02-15")];
        let outcome = filter_records(records, &conditions, None).unwrap();
        assert_eq!(outcome.retained(), 1);
    }
}
