/// One detection run, end to end.
///
/// filter -> group -> densify -> compare -> store. Only the store step can
/// fail a run once its metadata has been validated; everything before it
/// recovers per record and reports what it dropped in the `RunReport`.

use serde::Serialize;
use thiserror::Error;

use crate::analysis::SkipLog;
use crate::analysis::filter::{self, DateWindow, FilterError};
use crate::analysis::grouping::{self, GroupSpec};
use crate::analysis::stats::{self, StatsUndefined};
use crate::config::DetectionSettings;
use crate::logging;
use crate::model::{AnomalyResult, Record, RunMetadata};
use crate::query::ResponseStatus;
use crate::store::{self, AnomalyRepository, StoreError};

pub const NO_ANOMALIES_MESSAGE: &str = "no significant anomalies";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid run: {0}")]
    InvalidRun(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub total: usize,
    pub retained: usize,
    pub excluded: usize,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub filtered: FilterSummary,
    /// Records dropped by the filter and the grouper, by reason.
    pub skips: SkipLog,
    /// Records whose numeric field was unusable and counted as 0.
    pub coerced: usize,
    pub groups: usize,
    pub excluded_groups: Vec<(String, StatsUndefined)>,
    /// Every group with defined statistics, largest absolute change first.
    pub results: Vec<AnomalyResult>,
    pub anomaly_count: usize,
    pub stored: usize,
    pub message: String,
}

impl RunReport {
    pub fn skipped(&self) -> usize {
        self.skips.total()
    }

    pub fn anomalies(&self) -> impl Iterator<Item = &AnomalyResult> {
        self.results.iter().filter(|r| r.out_of_bounds)
    }
}

/// Checks the parts of a run that would make its statistics meaningless.
pub fn validate_run(metadata: &RunMetadata, settings: &DetectionSettings) -> Result<(), PipelineError> {
    let recent = &metadata.recent_period;
    let comparison = &metadata.comparison_period;

    if recent.start > recent.end {
        return Err(PipelineError::InvalidRun(format!(
            "recent period starts after it ends ({})",
            recent.label()
        )));
    }
    if comparison.start > comparison.end {
        return Err(PipelineError::InvalidRun(format!(
            "comparison period starts after it ends ({})",
            comparison.label()
        )));
    }
    if comparison.end >= recent.start {
        return Err(PipelineError::InvalidRun(format!(
            "comparison period ({}) must end before recent period ({}) starts",
            comparison.label(),
            recent.label()
        )));
    }
    if !settings.min_diff.is_finite() || settings.min_diff < 0.0 {
        return Err(PipelineError::InvalidRun(format!(
            "min_diff must be a non-negative number, got {}",
            settings.min_diff
        )));
    }
    if metadata.group_field.trim().is_empty() {
        return Err(PipelineError::InvalidRun("group_field is empty".to_string()));
    }
    Ok(())
}

/// Runs every stage except storage.
pub fn detect(
    records: Vec<Record>,
    metadata: &RunMetadata,
    settings: &DetectionSettings,
) -> Result<RunReport, PipelineError> {
    validate_run(metadata, settings)?;

    let recent = &metadata.recent_period;
    let comparison = &metadata.comparison_period;
    let window = metadata
        .date_field
        .as_deref()
        .map(|field| DateWindow::spanning(field, comparison, recent));

    let filtered = filter::filter_records_with_log(
        records,
        &metadata.filter_conditions,
        window.as_ref(),
        SkipLog::with_sample_limit(settings.max_skip_samples),
    )?;
    let summary = FilterSummary {
        total: filtered.total,
        retained: filtered.retained(),
        excluded: filtered.excluded,
    };

    let spec = GroupSpec {
        group_field: &metadata.group_field,
        numeric_field: metadata.numeric_field.as_deref(),
        date_field: metadata.date_field.as_deref(),
        period_type: metadata.period_type,
    };
    let mut grouped = grouping::group_records_with_log(&filtered.records, &spec, filtered.skips);
    grouping::densify(&mut grouped.series, comparison.start, recent.end);

    let outcome = stats::compare_periods(&grouped.series, recent, comparison, settings.min_diff);
    for (group, reason) in &outcome.excluded {
        tracing::debug!(group = group.as_str(), "group left out: {}", reason);
    }

    let anomaly_count = outcome.anomaly_count();
    let message = if anomaly_count == 0 {
        NO_ANOMALIES_MESSAGE.to_string()
    } else {
        format!(
            "{} of {} groups out of bounds for {}",
            anomaly_count,
            outcome.results.len(),
            metadata.display_name()
        )
    };

    Ok(RunReport {
        filtered: summary,
        skips: grouped.skips,
        coerced: grouped.coerced,
        groups: grouped.series.len(),
        excluded_groups: outcome.excluded,
        results: outcome.results,
        anomaly_count,
        stored: 0,
        message,
    })
}

/// Runs detection and replaces the series' active batch with the
/// out-of-bounds results. A run with no anomalies still supersedes.
pub fn run_detection<R: AnomalyRepository + ?Sized>(
    repository: &mut R,
    records: Vec<Record>,
    metadata: &RunMetadata,
    settings: &DetectionSettings,
) -> Result<RunReport, PipelineError> {
    let mut report = detect(records, metadata, settings)?;

    let anomalies: Vec<AnomalyResult> = report.anomalies().cloned().collect();
    report.stored = store::store_results(repository, &anomalies, metadata)?;

    logging::log_run_summary(metadata.display_name(), &report);
    Ok(report)
}

/// Caller-facing outcome of a run, shaped like the query responses. A run
/// with no anomalies is a success; any run failure is `status: "error"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResponse {
    pub status: ResponseStatus,
    pub anomaly_count: usize,
    pub stored: usize,
    pub skipped: usize,
    pub anomalies: Vec<AnomalyResult>,
    pub message: String,
}

impl From<Result<RunReport, PipelineError>> for RunResponse {
    fn from(outcome: Result<RunReport, PipelineError>) -> Self {
        match outcome {
            Ok(report) => RunResponse {
                status: ResponseStatus::Success,
                anomaly_count: report.anomaly_count,
                stored: report.stored,
                skipped: report.skipped(),
                anomalies: report.anomalies().cloned().collect(),
                message: report.message,
            },
            Err(e) => {
                tracing::error!("detection run failed: {}", e);
                RunResponse {
                    status: ResponseStatus::Error,
                    anomaly_count: 0,
                    stored: 0,
                    skipped: 0,
                    anomalies: Vec::new(),
                    message: e.to_string(),
                }
            }
        }
    }
}
