/// Durable anomaly storage with per-series versioning.
///
/// Rows are never deleted. Each detection run for a series key replaces
/// the key's active batch: inside one transaction every active row for the
/// key is marked inactive and the new batch is inserted active. Readers see
/// either the old batch or the new one, never neither or both.
///
/// Backends:
/// - `postgres`: production store (`anomalies` table, see `sql/`).
/// - `memory`:   in-process store with identical semantics.

pub mod memory;
pub mod postgres;

use serde_json::json;
use thiserror::Error;

use crate::model::{AnomalyRecord, AnomalyResult, PeriodKey, RunMetadata, SeriesKey};
use crate::query::AnomalyQuery;

pub use self::memory::MemoryRepository;
pub use self::postgres::PostgresRepository;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] ::postgres::Error),
    #[error("stored anomaly {id} is corrupt: {reason}")]
    CorruptRow { id: i64, reason: String },
    /// The backend is in maintenance mode and accepts no writes.
    #[error("anomaly store is read-only")]
    ReadOnly,
    #[error("anomaly store state is unavailable (lock poisoned)")]
    Poisoned,
}

/// One row of a batch about to be inserted. Series-key columns come from
/// the batch's key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnomaly {
    pub group_value: String,
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
}

/// Storage backend for anomaly rows.
pub trait AnomalyRepository {
    /// Deactivates every active row for `key` and inserts `rows` as the new
    /// active batch, atomically. Returns the new row ids in input order.
    /// On error nothing is changed.
    fn replace_active(&mut self, key: &SeriesKey, rows: &[NewAnomaly]) -> Result<Vec<i64>, StoreError>;

    /// Rows matching `query`, sorted and limited as it asks.
    fn find(&mut self, query: &AnomalyQuery) -> Result<Vec<AnomalyRecord>, StoreError>;

    /// A single row by id, active or not.
    fn get(&mut self, id: i64) -> Result<Option<AnomalyRecord>, StoreError>;
}

impl<R: AnomalyRepository + ?Sized> AnomalyRepository for &mut R {
    fn replace_active(&mut self, key: &SeriesKey, rows: &[NewAnomaly]) -> Result<Vec<i64>, StoreError> {
        (**self).replace_active(key, rows)
    }

    fn find(&mut self, query: &AnomalyQuery) -> Result<Vec<AnomalyRecord>, StoreError> {
        (**self).find(query)
    }

    fn get(&mut self, id: i64) -> Result<Option<AnomalyRecord>, StoreError> {
        (**self).get(id)
    }
}

// ---------------------------------------------------------------------------
// Storing a run
// ---------------------------------------------------------------------------

/// Persists one run's results as the new active batch of its series key.
/// Returns the number of rows stored.
pub fn store_results<R: AnomalyRepository + ?Sized>(
    repository: &mut R,
    results: &[AnomalyResult],
    metadata: &RunMetadata,
) -> Result<usize, StoreError> {
    let key = metadata.series_key();
    let rows = results
        .iter()
        .map(|result| build_row(result, metadata, key.district))
        .collect::<Vec<_>>();

    match repository.replace_active(&key, &rows) {
        Ok(ids) => {
            tracing::info!(series_key = %key, stored = ids.len(), "replaced active anomaly batch");
            Ok(ids.len())
        }
        Err(e) => {
            tracing::error!(series_key = %key, "anomaly batch rolled back: {}", e);
            Err(e)
        }
    }
}

/// Builds the insertable row for one result: buckets split into comparison
/// and recent sides, metadata blob with caption attached.
pub fn build_row(result: &AnomalyResult, metadata: &RunMetadata, district: i32) -> NewAnomaly {
    let mut row = NewAnomaly {
        group_value: result.group_value.clone(),
        comparison_mean: result.comparison_mean,
        recent_mean: result.recent_mean,
        difference: result.difference,
        std_dev: result.std_dev,
        out_of_bounds: result.out_of_bounds,
        comparison_dates: Vec::new(),
        comparison_counts: Vec::new(),
        recent_dates: Vec::new(),
        recent_counts: Vec::new(),
        metadata: metadata_blob(result, metadata, district),
    };

    for (label, count) in result.dates.iter().zip(&result.counts) {
        let Ok(key) = label.parse::<PeriodKey>() else {
            tracing::warn!(group = result.group_value.as_str(), bucket = label.as_str(), "unrecognized bucket label");
            continue;
        };
        if metadata.comparison_period.covers(key, metadata.period_type) {
            row.comparison_dates.push(label.clone());
            row.comparison_counts.push(*count);
        } else if metadata.recent_period.covers(key, metadata.period_type) {
            row.recent_dates.push(label.clone());
            row.recent_counts.push(*count);
        }
    }
    row
}

fn metadata_blob(result: &AnomalyResult, metadata: &RunMetadata, district: i32) -> serde_json::Value {
    json!({
        "recent_period": metadata.recent_period,
        "comparison_period": metadata.comparison_period,
        "group_field": metadata.group_field,
        "date_field": metadata.date_field,
        "numeric_field": metadata.numeric_field,
        "period_type": metadata.period_type,
        "y_axis_label": metadata.y_axis_label,
        "title": metadata.title,
        "filter_conditions": metadata.filter_conditions,
        "object_type": metadata.object_type,
        "object_id": metadata.object_id,
        "object_name": metadata.object_name,
        "district": district,
        "caption": caption(result, metadata),
    })
}

/// One-sentence summary of a result's direction and size.
pub fn caption(result: &AnomalyResult, metadata: &RunMetadata) -> String {
    let direction = if result.difference > 0.0 {
        "rose"
    } else if result.difference < 0.0 {
        "fell"
    } else {
        "was unchanged"
    };
    let percent = if result.comparison_mean != 0.0 {
        format!(" {:.1}%", (result.difference / result.comparison_mean * 100.0).abs())
    } else {
        String::new()
    };
    let mut caption = format!(
        "{}: {} {}{} from an average of {:.1} ({}) to {:.1} ({})",
        metadata.display_name(),
        result.group_value,
        direction,
        percent,
        result.comparison_mean,
        metadata.comparison_period.label(),
        result.recent_mean,
        metadata.recent_period.label(),
    );
    if result.std_dev > 0.0 {
        caption.push_str(&format!(
            ", {:.1} standard deviations",
            result.difference.abs() / result.std_dev
        ));
    }
    caption.push('.');
    caption
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
