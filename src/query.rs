/// Read API over stored anomalies.
///
/// Consumed by the report and dashboard layers. Requests arrive as loosely
/// typed parameter sets (`QueryRequest`), are validated into an
/// `AnomalyQuery`, and run against any `AnomalyRepository`. Every failure,
/// including database errors and unknown ids, comes back as a response with
/// `status: "error"` rather than an `Err`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dates::{self, Bound};
use crate::model::{AnomalyRecord, PeriodType};
use crate::store::AnomalyRepository;

/// Sort mode for a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Newest first.
    #[default]
    Recent,
    /// Group value ascending, then newest first.
    ByGroup,
    /// Oldest first.
    ByDate,
    /// Largest absolute difference first.
    ByAnomalySeverity,
    /// District ascending, then newest first.
    ByDistrict,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::Recent => "recent",
            QueryType::ByGroup => "by_group",
            QueryType::ByDate => "by_date",
            QueryType::ByAnomalySeverity => "by_anomaly_severity",
            QueryType::ByDistrict => "by_district",
        }
    }

    /// SQL `ORDER BY` body equivalent to `compare`. Group values sort
    /// bytewise (`COLLATE "C"`) to match `String` ordering.
    pub fn order_by(self) -> &'static str {
        match self {
            QueryType::Recent => "created_at DESC, id DESC",
            QueryType::ByGroup => "group_value COLLATE \"C\" ASC, created_at DESC, id DESC",
            QueryType::ByDate => "created_at ASC, id ASC",
            QueryType::ByAnomalySeverity => "ABS(difference) DESC, created_at DESC, id DESC",
            QueryType::ByDistrict => "district ASC, created_at DESC, id DESC",
        }
    }

    pub fn compare(self, a: &AnomalyRecord, b: &AnomalyRecord) -> Ordering {
        let newest_first = b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id));
        match self {
            QueryType::Recent => newest_first,
            QueryType::ByGroup => a.group_value.cmp(&b.group_value).then(newest_first),
            QueryType::ByDate => a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)),
            QueryType::ByAnomalySeverity => b
                .difference
                .abs()
                .total_cmp(&a.difference.abs())
                .then(newest_first),
            QueryType::ByDistrict => a.district.cmp(&b.district).then(newest_first),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "recent" => Ok(QueryType::Recent),
            "by_group" => Ok(QueryType::ByGroup),
            "by_date" => Ok(QueryType::ByDate),
            "by_anomaly_severity" => Ok(QueryType::ByAnomalySeverity),
            "by_district" => Ok(QueryType::ByDistrict),
            other => Err(format!("unknown query type '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Validated query
// ---------------------------------------------------------------------------

/// A validated set of filters, a sort mode and a limit.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyQuery {
    pub query_type: QueryType,
    /// `None` returns every match.
    pub limit: Option<usize>,
    /// Case-insensitive substring of `group_value`.
    pub group_filter: Option<String>,
    /// Earliest creation instant, inclusive.
    pub created_from: Option<DateTime<Utc>>,
    /// Latest creation instant, exclusive.
    pub created_before: Option<DateTime<Utc>>,
    pub only_anomalies: bool,
    pub only_active: bool,
    /// Case-insensitive substring of the metadata title or the object name.
    pub metric_name: Option<String>,
    pub district: Option<i32>,
    pub metric_id: Option<String>,
    pub period_type: Option<PeriodType>,
}

impl Default for AnomalyQuery {
    fn default() -> Self {
        Self {
            query_type: QueryType::Recent,
            limit: None,
            group_filter: None,
            created_from: None,
            created_before: None,
            only_anomalies: true,
            only_active: true,
            metric_name: None,
            district: None,
            metric_id: None,
            period_type: None,
        }
    }
}

impl AnomalyQuery {
    /// Creation-date filter over whole days: `start` 00:00 UTC up to the end
    /// of `end`.
    pub fn created_between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.created_from = start.map(start_of_day);
        self.created_before = end.and_then(|d| d.checked_add_days(Days::new(1))).map(start_of_day);
        self
    }

    /// In-process evaluation of the filters, used by backends without SQL.
    pub fn matches(&self, record: &AnomalyRecord) -> bool {
        if self.only_active && !record.is_active {
            return false;
        }
        if self.only_anomalies && !record.out_of_bounds {
            return false;
        }
        if let Some(filter) = &self.group_filter {
            if !contains_ignore_case(&record.group_value, filter) {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| record.created_at < from) {
            return false;
        }
        if self.created_before.is_some_and(|before| record.created_at >= before) {
            return false;
        }
        if let Some(name) = &self.metric_name {
            let title = record.metadata_str("title");
            if !contains_ignore_case(title, name) && !contains_ignore_case(&record.object_name, name) {
                return false;
            }
        }
        if self.district.is_some_and(|d| record.district != d) {
            return false;
        }
        if let Some(id) = &self.metric_id {
            if &record.object_id != id {
                return false;
            }
        }
        if self.period_type.is_some_and(|p| record.period_type != p) {
            return false;
        }
        true
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// `ILIKE` pattern matching `needle` anywhere, with wildcards escaped.
pub fn ilike_contains(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Raw query parameters as sent by the report layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub group_filter: Option<String>,
    #[serde(default)]
    pub date_start: Option<String>,
    #[serde(default)]
    pub date_end: Option<String>,
    #[serde(default = "default_true")]
    pub only_anomalies: bool,
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub district_filter: Option<String>,
    #[serde(default)]
    pub metric_id: Option<String>,
    #[serde(default)]
    pub period_type: Option<String>,
    #[serde(default = "default_true")]
    pub only_active: bool,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            query_type: None,
            limit: None,
            group_filter: None,
            date_start: None,
            date_end: None,
            only_anomalies: true,
            metric_name: None,
            district_filter: None,
            metric_id: None,
            period_type: None,
            only_active: true,
        }
    }
}

impl QueryRequest {
    /// Validates the request. `default_limit` applies when no limit is
    /// given; a limit of 0 means unlimited.
    pub fn to_query(&self, default_limit: usize) -> Result<AnomalyQuery, String> {
        let query_type = match non_empty(&self.query_type) {
            Some(name) => name.parse()?,
            None => QueryType::Recent,
        };
        let start = non_empty(&self.date_start)
            .map(|s| dates::resolve_bound(s, Bound::Start))
            .transpose()
            .map_err(|e| format!("date_start: {}", e))?;
        let end = non_empty(&self.date_end)
            .map(|s| dates::resolve_bound(s, Bound::End))
            .transpose()
            .map_err(|e| format!("date_end: {}", e))?;
        let district = non_empty(&self.district_filter)
            .map(|s| s.trim().parse::<i32>().map_err(|_| format!("invalid district '{}'", s)))
            .transpose()?;
        let period_type = non_empty(&self.period_type).map(str::parse).transpose()?;
        let limit = match self.limit.unwrap_or(default_limit) {
            0 => None,
            n => Some(n),
        };

        Ok(AnomalyQuery {
            query_type,
            limit,
            group_filter: non_empty(&self.group_filter).map(String::from),
            only_anomalies: self.only_anomalies,
            only_active: self.only_active,
            metric_name: non_empty(&self.metric_name).map(String::from),
            district,
            metric_id: non_empty(&self.metric_id).map(String::from),
            period_type,
            ..AnomalyQuery::default()
        }
        .created_between(start, end))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub status: ResponseStatus,
    pub count: usize,
    pub results: Vec<AnomalyRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QueryResponse {
    fn error(message: String) -> Self {
        Self {
            status: ResponseStatus::Error,
            count: 0,
            results: Vec::new(),
            message: Some(message),
        }
    }
}

/// Chart-ready series: comparison buckets followed by recent buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartData {
    pub dates: Vec<String>,
    pub values: Vec<f64>,
    pub periods: Vec<String>,
}

impl ChartData {
    pub fn from_record(record: &AnomalyRecord) -> Self {
        let mut chart = ChartData::default();
        for (label, dates, values) in [
            ("comparison", &record.comparison_dates, &record.comparison_counts),
            ("recent", &record.recent_dates, &record.recent_counts),
        ] {
            for (date, value) in dates.iter().zip(values) {
                chart.dates.push(date.clone());
                chart.values.push(*value);
                chart.periods.push(label.to_string());
            }
        }
        chart
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyDetail {
    #[serde(flatten)]
    pub record: AnomalyRecord,
    pub chart_data: ChartData,
    pub y_axis_label: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailResponse {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<AnomalyDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DetailResponse {
    fn error(message: String) -> Self {
        Self {
            status: ResponseStatus::Error,
            anomaly: None,
            message: Some(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Query front end over a repository.
pub struct AnomalyQueryService<R> {
    repository: R,
    default_limit: usize,
}

impl<R: AnomalyRepository> AnomalyQueryService<R> {
    pub fn new(repository: R, default_limit: usize) -> Self {
        Self {
            repository,
            default_limit,
        }
    }

    pub fn repository_mut(&mut self) -> &mut R {
        &mut self.repository
    }

    pub fn into_inner(self) -> R {
        self.repository
    }

    pub fn query(&mut self, request: &QueryRequest) -> QueryResponse {
        let query = match request.to_query(self.default_limit) {
            Ok(query) => query,
            Err(message) => {
                tracing::warn!("rejected anomaly query: {}", message);
                return QueryResponse::error(message);
            }
        };
        self.run(&query)
    }

    /// Runs an already-validated query.
    pub fn run(&mut self, query: &AnomalyQuery) -> QueryResponse {
        match self.repository.find(query) {
            Ok(results) => {
                tracing::debug!(query_type = %query.query_type, count = results.len(), "anomaly query");
                QueryResponse {
                    status: ResponseStatus::Success,
                    count: results.len(),
                    results,
                    message: None,
                }
            }
            Err(e) => {
                tracing::error!("anomaly query failed: {}", e);
                QueryResponse::error(format!("query failed: {}", e))
            }
        }
    }

    pub fn get_detail(&mut self, id: i64) -> DetailResponse {
        match self.repository.get(id) {
            Ok(Some(record)) => {
                let chart_data = ChartData::from_record(&record);
                let y_axis_label = record.metadata_str("y_axis_label").to_string();
                let title = record.metadata_str("title").to_string();
                DetailResponse {
                    status: ResponseStatus::Success,
                    anomaly: Some(AnomalyDetail {
                        record,
                        chart_data,
                        y_axis_label,
                        title,
                    }),
                    message: None,
                }
            }
            Ok(None) => DetailResponse::error(format!("anomaly {} not found", id)),
            Err(e) => {
                tracing::error!(id, "anomaly detail lookup failed: {}", e);
                DetailResponse::error(format!("lookup failed: {}", e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
