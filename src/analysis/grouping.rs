/// Groups filtered records into per-group period series.
///
/// Each record lands in one `(group value, period bucket)` cell and its
/// numeric field is summed into that cell. After grouping, `densify` adds a
/// zero for every bucket of the analysis range a group never reported, so
/// sparse groups are not flattered by the statistics that follow.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::analysis::SkipLog;
use crate::analysis::filter::record_date;
use crate::model::{PeriodKey, PeriodType, Record, RecordError, Scalar};

/// Which fields drive grouping for a run.
#[derive(Debug, Clone, Copy)]
pub struct GroupSpec<'a> {
    pub group_field: &'a str,
    /// Summed per bucket; `None` counts records.
    pub numeric_field: Option<&'a str>,
    /// Bucketed by `period_type`; `None` puts every record in `PeriodKey::All`.
    pub date_field: Option<&'a str>,
    pub period_type: PeriodType,
}

/// `group value -> (bucket -> aggregated value)`, both chronologically and
/// lexically ordered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedSeries {
    pub period_type: PeriodType,
    pub groups: BTreeMap<String, BTreeMap<PeriodKey, f64>>,
}

impl GroupedSeries {
    pub fn new(period_type: PeriodType) -> Self {
        Self {
            period_type,
            groups: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, group: &str) -> Option<&BTreeMap<PeriodKey, f64>> {
        self.groups.get(group)
    }

    fn add(&mut self, group: String, period: PeriodKey, value: f64) {
        *self.groups.entry(group).or_default().entry(period).or_insert(0.0) += value;
    }
}

#[derive(Debug, Clone)]
pub struct GroupingOutcome {
    pub series: GroupedSeries,
    pub skips: SkipLog,
    /// Records whose numeric field was missing or non-numeric and counted as 0.
    pub coerced: usize,
}

/// Buckets and sums `records` according to `spec`.
pub fn group_records(records: &[Record], spec: &GroupSpec<'_>) -> GroupingOutcome {
    group_records_with_log(records, spec, SkipLog::default())
}

pub fn group_records_with_log(records: &[Record], spec: &GroupSpec<'_>, mut skips: SkipLog) -> GroupingOutcome {
    let mut series = GroupedSeries::new(spec.period_type);
    let mut coerced = 0;

    for (index, record) in records.iter().enumerate() {
        let group = match record.get(spec.group_field) {
            Some(Scalar::Null) | None => {
                skips.record(index, RecordError::MissingField(spec.group_field.to_string()));
                continue;
            }
            Some(value) => value.to_string(),
        };

        let period = match spec.date_field {
            Some(field) => match record_date(record, field) {
                Ok(date) => PeriodKey::for_date(date, spec.period_type),
                Err(e) => {
                    skips.record(index, e);
                    continue;
                }
            },
            None => PeriodKey::All,
        };

        let value = match spec.numeric_field {
            None => 1.0,
            Some(field) => match record.get(field).and_then(Scalar::as_number) {
                Some(n) => n,
                None => {
                    coerced += 1;
                    tracing::warn!(
                        record = index,
                        field,
                        value = %record.get(field).map(|v| v.to_string()).unwrap_or_default(),
                        "non-numeric value counted as 0"
                    );
                    0.0
                }
            },
        };

        series.add(group, period, value);
    }

    tracing::debug!(
        groups = series.len(),
        skipped = skips.total(),
        coerced,
        "grouped {} records",
        records.len()
    );

    GroupingOutcome { series, skips, coerced }
}

/// Fills every bucket from `start` to `end` (inclusive, at the series'
/// granularity) with 0 in every group that lacks it.
pub fn densify(series: &mut GroupedSeries, start: NaiveDate, end: NaiveDate) {
    let buckets = bucket_range(start, end, series.period_type);
    for periods in series.groups.values_mut() {
        if periods.contains_key(&PeriodKey::All) {
            continue;
        }
        for bucket in &buckets {
            periods.entry(*bucket).or_insert(0.0);
        }
    }
}

/// Continuous list of buckets covering `start..=end`.
pub fn bucket_range(start: NaiveDate, end: NaiveDate, period_type: PeriodType) -> Vec<PeriodKey> {
    let last = PeriodKey::for_date(end, period_type);
    let mut current = Some(PeriodKey::for_date(start, period_type));
    let mut buckets = Vec::new();
    while let Some(bucket) = current {
        if bucket > last {
            break;
        }
        buckets.push(bucket);
        current = bucket.next();
    }
    buckets
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
