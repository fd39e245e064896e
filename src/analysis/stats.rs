/// Recent-versus-comparison statistics per group.
///
/// For each group the densified buckets are split by period. The
/// comparison buckets give the baseline mean and population standard
/// deviation; the recent buckets give the recent mean. A group is flagged
/// when all of the following hold, each strictly:
///
///   comparison std dev > 0
///   |recent mean - comparison mean| > comparison std dev * min_diff
///   comparison mean > NOISE_FLOOR
///   recent mean > NOISE_FLOOR
///
/// Groups with no buckets on either side have undefined statistics and are
/// left out of the results entirely.

use thiserror::Error;

use crate::analysis::grouping::GroupedSeries;
use crate::model::{AnomalyResult, NOISE_FLOOR, Period};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StatsUndefined {
    #[error("no buckets in the comparison period")]
    NoComparisonData,
    #[error("no buckets in the recent period")]
    NoRecentData,
}

/// Population statistics over one bucket list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStats {
    pub mean: f64,
    pub std_dev: f64,
    pub count: usize,
}

/// Mean and population standard deviation (divides by N).
/// Returns `None` for an empty list.
pub fn population_stats(values: &[f64]) -> Option<BucketStats> {
    if values.is_empty() {
        return None;
    }
    // A constant list is exactly flat; summing it can leave rounding noise.
    if values.iter().all(|v| *v == values[0]) {
        return Some(BucketStats {
            mean: values[0],
            std_dev: 0.0,
            count: values.len(),
        });
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(BucketStats {
        mean,
        std_dev: variance.sqrt(),
        count: values.len(),
    })
}

/// The flagging rule. Every comparison is strict.
pub fn is_out_of_bounds(comparison: &BucketStats, recent_mean: f64, min_diff: f64) -> bool {
    let difference = recent_mean - comparison.mean;
    comparison.std_dev > 0.0
        && difference.abs() > comparison.std_dev * min_diff
        && comparison.mean > NOISE_FLOOR
        && recent_mean > NOISE_FLOOR
}

#[derive(Debug, Clone, Default)]
pub struct ComparisonOutcome {
    /// Every group with defined statistics, largest absolute change first.
    pub results: Vec<AnomalyResult>,
    /// Groups left out because one side had no buckets.
    pub excluded: Vec<(String, StatsUndefined)>,
}

impl ComparisonOutcome {
    pub fn anomalies(&self) -> impl Iterator<Item = &AnomalyResult> {
        self.results.iter().filter(|r| r.out_of_bounds)
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomalies().count()
    }
}

/// Compares every group of `series` between the two periods.
///
/// A bucket inside both periods (a month straddling the boundary) is
/// counted on the comparison side only. Buckets inside neither are
/// ignored for statistics but kept in the result's `dates`/`counts`.
pub fn compare_periods(
    series: &GroupedSeries,
    recent: &Period,
    comparison: &Period,
    min_diff: f64,
) -> ComparisonOutcome {
    let mut outcome = ComparisonOutcome::default();

    for (group, buckets) in &series.groups {
        let mut comparison_values = Vec::new();
        let mut recent_values = Vec::new();
        let mut dates = Vec::with_capacity(buckets.len());
        let mut counts = Vec::with_capacity(buckets.len());

        for (key, value) in buckets {
            if comparison.covers(*key, series.period_type) {
                comparison_values.push(*value);
            } else if recent.covers(*key, series.period_type) {
                recent_values.push(*value);
            }
            dates.push(key.to_string());
            counts.push(*value);
        }

        let comparison_stats = match population_stats(&comparison_values) {
            Some(stats) => stats,
            None => {
                outcome.excluded.push((group.clone(), StatsUndefined::NoComparisonData));
                continue;
            }
        };
        let recent_stats = match population_stats(&recent_values) {
            Some(stats) => stats,
            None => {
                outcome.excluded.push((group.clone(), StatsUndefined::NoRecentData));
                continue;
            }
        };

        let difference = recent_stats.mean - comparison_stats.mean;
        let out_of_bounds = is_out_of_bounds(&comparison_stats, recent_stats.mean, min_diff);
        if out_of_bounds {
            tracing::debug!(
                group = group.as_str(),
                comparison_mean = comparison_stats.mean,
                recent_mean = recent_stats.mean,
                std_dev = comparison_stats.std_dev,
                "group out of bounds"
            );
        }

        outcome.results.push(AnomalyResult {
            group_value: group.clone(),
            comparison_mean: comparison_stats.mean,
            recent_mean: recent_stats.mean,
            difference,
            std_dev: comparison_stats.std_dev,
            out_of_bounds,
            dates,
            counts,
        });
    }

    // Stable: equal movers keep group order.
    outcome
        .results
        .sort_by(|a, b| b.difference.abs().total_cmp(&a.difference.abs()));
    outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::grouping::densify;
    use crate::model::{PeriodKey, PeriodType};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Comparison: Jan..=len months of 2023. Recent: the following months.
    fn series_of(groups: &[(&str, &[f64], &[f64])]) -> (GroupedSeries, Period, Period) {
        let mut series = GroupedSeries::new(PeriodType::Month);
        let mut max_cmp = 0;
        let mut max_rec = 0;
        for (name, comparison, recent) in groups {
            let mut buckets = BTreeMap::new();
            for (i, v) in comparison.iter().enumerate() {
                buckets.insert(PeriodKey::Month { year: 2023, month: i as u32 + 1 }, *v);
            }
            for (i, v) in recent.iter().enumerate() {
                buckets.insert(
                    PeriodKey::Month { year: 2023, month: (comparison.len() + i) as u32 + 1 },
                    *v,
                );
            }
            max_cmp = max_cmp.max(comparison.len());
            max_rec = max_rec.max(recent.len());
            series.groups.insert(name.to_string(), buckets);
        }
        let cmp_end = crate::dates::last_day_of_month(2023, max_cmp as u32).unwrap();
        let rec_end = crate::dates::last_day_of_month(2023, (max_cmp + max_rec) as u32).unwrap();
        let comparison = Period::new(ymd(2023, 1, 1), cmp_end);
        let recent = Period::new(cmp_end.succ_opt().unwrap(), rec_end);
        (series, recent, comparison)
    }

    #[test]
    fn test_population_std_dev_divides_by_n() {
        let stats = population_stats(&[10.0, 12.0, 11.0, 9.0]).unwrap();
        assert_eq!(stats.mean, 10.5);
        assert!((stats.std_dev - 1.25f64.sqrt()).abs() < 1e-12);
        assert!(population_stats(&[]).is_none());
    }

    #[test]
    fn test_sample_scenario_is_flagged() {
        let (series, recent, comparison) = series_of(&[("Mission", &[10.0, 12.0, 11.0, 9.0], &[20.0])]);
        let outcome = compare_periods(&series, &recent, &comparison, 2.0);
        let result = &outcome.results[0];

        assert_eq!(result.comparison_mean, 10.5);
        assert_eq!(result.recent_mean, 20.0);
        assert_eq!(result.difference, 9.5);
        assert!((result.std_dev - 1.118).abs() < 1e-3);
        assert!(result.out_of_bounds);
        assert_eq!(result.dates, vec!["2023-01", "2023-02", "2023-03", "2023-04", "2023-05"]);
    }

    #[test]
    fn test_floor_boundary() {
        let at_floor = BucketStats { mean: 2.0, std_dev: 1.0, count: 4 };
        assert!(!is_out_of_bounds(&at_floor, 10.0, 2.0));

        let above_floor = BucketStats { mean: 2.01, std_dev: 1.0, count: 4 };
        assert!(is_out_of_bounds(&above_floor, 10.0, 2.0));

        // Recent side floor: a drop to exactly 2.0 is never flagged.
        let high = BucketStats { mean: 20.0, std_dev: 1.0, count: 4 };
        assert!(!is_out_of_bounds(&high, 2.0, 2.0));
        assert!(is_out_of_bounds(&high, 2.5, 2.0));
    }

    #[test]
    fn test_deviation_boundary_is_strict() {
        // [4, 6, 4, 6]: mean 5, population std dev exactly 1.
        let (series, recent, comparison) = series_of(&[
            ("Exact", &[4.0, 6.0, 4.0, 6.0], &[7.0]),
            ("Over", &[4.0, 6.0, 4.0, 6.0], &[7.000001]),
        ]);
        let outcome = compare_periods(&series, &recent, &comparison, 2.0);
        let exact = outcome.results.iter().find(|r| r.group_value == "Exact").unwrap();
        let over = outcome.results.iter().find(|r| r.group_value == "Over").unwrap();

        assert_eq!(exact.std_dev, 1.0);
        assert_eq!(exact.difference, 2.0);
        assert!(!exact.out_of_bounds);
        assert!(over.out_of_bounds);
    }

    #[test]
    fn test_zero_variance_never_flags() {
        let (series, recent, comparison) = series_of(&[("Flat", &[10.0, 10.0, 10.0], &[1000.0])]);
        let outcome = compare_periods(&series, &recent, &comparison, 2.0);
        assert_eq!(outcome.results[0].std_dev, 0.0);
        assert!(!outcome.results[0].out_of_bounds);
    }

    #[test]
    fn test_fractional_constant_baseline_never_flags() {
        let (series, recent, comparison) = series_of(&[
            ("Dept", &[3.3, 3.3, 3.3], &[3.4]),
            ("Tenths", &[0.1, 0.1, 0.1], &[25.0]),
        ]);
        let outcome = compare_periods(&series, &recent, &comparison, 2.0);

        let dept = outcome.results.iter().find(|r| r.group_value == "Dept").unwrap();
        assert_eq!(dept.comparison_mean, 3.3);
        assert_eq!(dept.std_dev, 0.0);
        assert!(!dept.out_of_bounds);

        let tenths = outcome.results.iter().find(|r| r.group_value == "Tenths").unwrap();
        assert_eq!(tenths.std_dev, 0.0);
        assert_eq!(outcome.anomaly_count(), 0);
    }

    #[test]
    fn test_all_zero_series_is_below_floor() {
        let (series, recent, comparison) = series_of(&[("Quiet", &[0.0, 0.0, 0.0], &[0.0])]);
        let outcome = compare_periods(&series, &recent, &comparison, 2.0);
        assert_eq!(outcome.results[0].comparison_mean, 0.0);
        assert_eq!(outcome.anomaly_count(), 0);
    }

    #[test]
    fn test_group_without_comparison_data_is_excluded() {
        let mut series = GroupedSeries::new(PeriodType::Month);
        series.groups.insert(
            "New".to_string(),
            BTreeMap::from([(PeriodKey::Month { year: 2024, month: 1 }, 50.0)]),
        );
        let comparison = Period::new(ymd(2023, 1, 1), ymd(2023, 12, 31));
        let recent = Period::new(ymd(2024, 1, 1), ymd(2024, 1, 31));
        let outcome = compare_periods(&series, &recent, &comparison, 2.0);

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.excluded, vec![("New".to_string(), StatsUndefined::NoComparisonData)]);
    }

    #[test]
    fn test_single_bucket_series_has_no_baseline() {
        let mut series = GroupedSeries::new(PeriodType::Month);
        series
            .groups
            .insert("All".to_string(), BTreeMap::from([(PeriodKey::All, 50.0)]));
        let comparison = Period::new(ymd(2023, 1, 1), ymd(2023, 12, 31));
        let recent = Period::new(ymd(2024, 1, 1), ymd(2024, 1, 31));
        let outcome = compare_periods(&series, &recent, &comparison, 2.0);
        assert_eq!(outcome.excluded.len(), 1);
    }

    #[test]
    fn test_densified_gaps_count_toward_statistics() {
        // Data only in the first and last comparison months.
        let mut series = GroupedSeries::new(PeriodType::Month);
        series.groups.insert(
            "Sparse".to_string(),
            BTreeMap::from([
                (PeriodKey::Month { year: 2023, month: 1 }, 12.0),
                (PeriodKey::Month { year: 2023, month: 12 }, 12.0),
                (PeriodKey::Month { year: 2024, month: 1 }, 30.0),
            ]),
        );
        densify(&mut series, ymd(2023, 1, 1), ymd(2024, 1, 31));
        let comparison = Period::new(ymd(2023, 1, 1), ymd(2023, 12, 31));
        let recent = Period::new(ymd(2024, 1, 1), ymd(2024, 1, 31));
        let outcome = compare_periods(&series, &recent, &comparison, 2.0);
        let result = &outcome.results[0];

        assert_eq!(result.dates.len(), 13);
        assert_eq!(result.comparison_mean, 2.0);
        // Mean of 2.0 does not clear the floor even though the jump is large.
        assert!(!result.out_of_bounds);
    }

    #[test]
    fn test_results_sorted_by_absolute_difference() {
        let (series, recent, comparison) = series_of(&[
            ("Small", &[10.0, 12.0], &[14.0]),
            ("Drop", &[50.0, 52.0], &[5.0]),
            ("Rise", &[10.0, 12.0], &[30.0]),
        ]);
        let outcome = compare_periods(&series, &recent, &comparison, 2.0);
        let order: Vec<_> = outcome.results.iter().map(|r| r.group_value.as_str()).collect();
        assert_eq!(order, vec!["Drop", "Rise", "Small"]);
        assert!(outcome.results[0].difference < 0.0);
    }
}
