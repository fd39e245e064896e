//! Civic-data anomaly detection and persistence.
//!
//! Records supplied by the caller are filtered, grouped into per-period
//! series, compared between a recent and a comparison period, and the
//! groups whose change is statistically significant are stored as the new
//! active batch of their series. A query service reads them back.
//!
//! Modules:
//! - `model`:     records, run metadata, periods, anomaly rows
//! - `dates`:     ordered date-format parsing
//! - `analysis`:  filter, grouping and statistics stages
//! - `store`:     versioned persistence (PostgreSQL and in-memory)
//! - `query`:     anomaly listing and detail lookups
//! - `pipeline`:  one detection run, end to end
//! - `db`:        connection and schema helpers
//! - `config`:    TOML service configuration
//! - `logging`:   tracing subscriber setup and run summaries

pub mod analysis;
pub mod config;
pub mod dates;
pub mod db;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod store;
