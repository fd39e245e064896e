/// Detection pipeline stages.
///
/// Data flows strictly through these modules in order; none of them touch
/// the database and none of them fail on a single bad record.
///
/// Submodules:
/// - `filter`:   applies the run's date window and field conditions.
/// - `grouping`: buckets records by group and period, sums, densifies.
/// - `stats`:    compares recent and comparison buckets per group.

pub mod filter;
pub mod grouping;
pub mod stats;

use std::collections::BTreeMap;

use crate::model::RecordError;

/// Default number of individual skip entries retained for inspection.
pub const DEFAULT_SKIP_SAMPLES: usize = 50;

/// A record that was skipped, by position in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipEntry {
    pub index: usize,
    pub error: RecordError,
}

/// Per-run accumulation of per-record problems.
///
/// Counts are kept for every skip; only the first `sample_limit` entries
/// are retained verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipLog {
    counts: BTreeMap<&'static str, usize>,
    samples: Vec<SkipEntry>,
    sample_limit: usize,
}

impl Default for SkipLog {
    fn default() -> Self {
        Self::with_sample_limit(DEFAULT_SKIP_SAMPLES)
    }
}

impl SkipLog {
    pub fn with_sample_limit(sample_limit: usize) -> Self {
        Self {
            counts: BTreeMap::new(),
            samples: Vec::new(),
            sample_limit,
        }
    }

    pub fn record(&mut self, index: usize, error: RecordError) {
        tracing::debug!(record = index, reason = error.kind(), "skipping record: {}", error);
        *self.counts.entry(error.kind()).or_insert(0) += 1;
        if self.samples.len() < self.sample_limit {
            self.samples.push(SkipEntry { index, error });
        }
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Number of skips with the given `RecordError::kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.counts.get(kind).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &BTreeMap<&'static str, usize> {
        &self.counts
    }

    pub fn samples(&self) -> &[SkipEntry] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
