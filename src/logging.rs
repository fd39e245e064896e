/// Structured logging for the anomaly service.
///
/// Installs a `tracing` subscriber with a human-readable console layer and
/// an optional plain-text file layer for scheduled runs. `RUST_LOG`, when
/// set, overrides the configured level. The summary helpers pick a level
/// from the outcome so that a run that lost records stands out in the log.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt as tfmt};

use crate::analysis::filter::FilterOutcome;
use crate::pipeline::RunReport;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("a global logger is already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Installs the global subscriber.
///
/// `console_timestamps = false` gives compact console lines for interactive
/// use; the file layer always carries timestamps.
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(min_level.directive()));

    let console = if console_timestamps {
        tfmt::layer().with_target(false).boxed()
    } else {
        tfmt::layer().with_target(false).without_time().boxed()
    };

    let file = match log_file {
        Some(path) => {
            let handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::LogFile {
                    path: path.to_string(),
                    source,
                })?;
            Some(tfmt::layer().with_ansi(false).with_writer(Mutex::new(handle)).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Summary Logging
// ---------------------------------------------------------------------------

/// Logs the retained/skipped split of one filter pass.
pub fn log_filter_summary(outcome: &FilterOutcome) {
    let message = format!(
        "Filter complete: {}/{} retained, {} excluded, {} skipped",
        outcome.retained(),
        outcome.total,
        outcome.excluded,
        outcome.skipped()
    );
    let skip_counts = format!("{:?}", outcome.skips.counts());

    if outcome.skipped() == 0 {
        tracing::info!("{}", message);
    } else if outcome.retained() == 0 {
        tracing::error!(skips = %skip_counts, "{}", message);
    } else {
        tracing::warn!(skips = %skip_counts, "{}", message);
    }
}

/// Logs the outcome of a complete detection run.
pub fn log_run_summary(metric: &str, report: &RunReport) {
    let message = format!(
        "Detection complete for {}: {} groups compared, {} anomalies, {} stored, {} records skipped",
        metric,
        report.results.len(),
        report.anomaly_count,
        report.stored,
        report.skipped()
    );

    if report.filtered.retained == 0 && report.filtered.total > 0 {
        tracing::error!("{}", message);
    } else if report.skipped() > 0 || !report.excluded_groups.is_empty() {
        tracing::warn!("{}", message);
    } else {
        tracing::info!("{}", message);
    }
}
