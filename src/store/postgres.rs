/// PostgreSQL anomaly store.
///
/// Uses the `anomalies` table from `sql/001_anomalies.sql`. The supersede
/// step runs in one transaction that first takes a transaction-scoped
/// advisory lock on the series key, so two concurrent runs for the same key
/// serialize while runs for different keys never wait on each other. If
/// anything fails the transaction is dropped and rolled back, leaving the
/// previous active batch in place.

use ::postgres::types::ToSql;
use ::postgres::{Client, NoTls, Row};

use super::{AnomalyRepository, NewAnomaly, StoreError};
use crate::model::{AnomalyRecord, SeriesKey};
use crate::query::{AnomalyQuery, ilike_contains};

const SELECT_COLUMNS: &str = "id, group_value, group_field_name, period_type, object_type, object_id, \
     object_name, district, comparison_mean, recent_mean, difference, std_dev, out_of_bounds, \
     comparison_dates, comparison_counts, recent_dates, recent_counts, metadata, is_active, created_at";

const SERIES_KEY_PREDICATE: &str = "object_type = $1 AND object_id = $2 AND object_name = $3 \
     AND group_field_name = $4 AND period_type = $5 AND district = $6";

const INSERT_ANOMALY: &str = "
    INSERT INTO anomalies (
        group_value, group_field_name, period_type, object_type, object_id, object_name,
        district, comparison_mean, recent_mean, difference, std_dev, out_of_bounds,
        comparison_dates, comparison_counts, recent_dates, recent_counts, metadata, is_active
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, TRUE)
    RETURNING id
";

pub struct PostgresRepository {
    client: Client,
}

impl PostgresRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(Client::connect(database_url, NoTls)?))
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    pub fn into_inner(self) -> Client {
        self.client
    }

    /// Active rows for one series key, oldest id first.
    pub fn active_rows(&mut self, key: &SeriesKey) -> Result<Vec<AnomalyRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM anomalies WHERE is_active AND {} ORDER BY id",
            SELECT_COLUMNS, SERIES_KEY_PREDICATE
        );
        let rows = self.client.query(
            sql.as_str(),
            &[
                &key.object_type,
                &key.object_id,
                &key.object_name,
                &key.group_field,
                &key.period_type.as_str(),
                &key.district,
            ],
        )?;
        rows.iter().map(record_from_row).collect()
    }
}

impl AnomalyRepository for PostgresRepository {
    fn replace_active(&mut self, key: &SeriesKey, rows: &[NewAnomaly]) -> Result<Vec<i64>, StoreError> {
        let period_type = key.period_type.as_str();
        let mut tx = self.client.transaction()?;

        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&key.to_string()])?;

        let deactivated = tx.execute(
            format!("UPDATE anomalies SET is_active = FALSE WHERE is_active AND {}", SERIES_KEY_PREDICATE).as_str(),
            &[
                &key.object_type,
                &key.object_id,
                &key.object_name,
                &key.group_field,
                &period_type,
                &key.district,
            ],
        )?;

        let insert = tx.prepare(INSERT_ANOMALY)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let inserted = tx.query_one(
                &insert,
                &[
                    &row.group_value,
                    &key.group_field,
                    &period_type,
                    &key.object_type,
                    &key.object_id,
                    &key.object_name,
                    &key.district,
                    &row.comparison_mean,
                    &row.recent_mean,
                    &row.difference,
                    &row.std_dev,
                    &row.out_of_bounds,
                    &row.comparison_dates,
                    &row.comparison_counts,
                    &row.recent_dates,
                    &row.recent_counts,
                    &row.metadata,
                ],
            )?;
            ids.push(inserted.try_get::<_, i64>(0)?);
        }

        tx.commit()?;
        tracing::debug!(series_key = %key, deactivated, inserted = ids.len(), "committed anomaly batch");
        Ok(ids)
    }

    fn find(&mut self, query: &AnomalyQuery) -> Result<Vec<AnomalyRecord>, StoreError> {
        let statement = build_select(query);
        let params: Vec<&(dyn ToSql + Sync)> = statement.params.iter().map(|p| p.as_ref()).collect();
        let rows = self.client.query(statement.sql.as_str(), &params)?;
        rows.iter().map(record_from_row).collect()
    }

    fn get(&mut self, id: i64) -> Result<Option<AnomalyRecord>, StoreError> {
        let sql = format!("SELECT {} FROM anomalies WHERE id = $1", SELECT_COLUMNS);
        self.client
            .query_opt(sql.as_str(), &[&id])?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Query translation
// ---------------------------------------------------------------------------

/// A parameterized `SELECT` built from an `AnomalyQuery`.
pub struct SelectStatement {
    pub sql: String,
    pub params: Vec<Box<dyn ToSql + Sync>>,
}

impl SelectStatement {
    fn bind<T: ToSql + Sync + 'static>(&mut self, value: T) -> String {
        self.params.push(Box::new(value));
        format!("${}", self.params.len())
    }
}

pub fn build_select(query: &AnomalyQuery) -> SelectStatement {
    let mut statement = SelectStatement {
        sql: String::new(),
        params: Vec::new(),
    };
    let mut clauses: Vec<String> = Vec::new();

    if query.only_active {
        clauses.push("is_active".to_string());
    }
    if query.only_anomalies {
        clauses.push("out_of_bounds".to_string());
    }
    if let Some(filter) = &query.group_filter {
        let p = statement.bind(ilike_contains(filter));
        clauses.push(format!("group_value ILIKE {}", p));
    }
    if let Some(from) = query.created_from {
        let p = statement.bind(from);
        clauses.push(format!("created_at >= {}", p));
    }
    if let Some(before) = query.created_before {
        let p = statement.bind(before);
        clauses.push(format!("created_at < {}", p));
    }
    if let Some(name) = &query.metric_name {
        let p = statement.bind(ilike_contains(name));
        clauses.push(format!("(metadata->>'title' ILIKE {0} OR object_name ILIKE {0})", p));
    }
    if let Some(district) = query.district {
        let p = statement.bind(district);
        clauses.push(format!("district = {}", p));
    }
    if let Some(metric_id) = &query.metric_id {
        let p = statement.bind(metric_id.clone());
        clauses.push(format!("object_id = {}", p));
    }
    if let Some(period_type) = query.period_type {
        let p = statement.bind(period_type.as_str());
        clauses.push(format!("period_type = {}", p));
    }

    let mut sql = format!("SELECT {} FROM anomalies", SELECT_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(query.query_type.order_by());
    if let Some(limit) = query.limit {
        let p = statement.bind(i64::try_from(limit).unwrap_or(i64::MAX));
        sql.push_str(&format!(" LIMIT {}", p));
    }
    statement.sql = sql;
    statement
}

fn record_from_row(row: &Row) -> Result<AnomalyRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let period_type: String = row.try_get("period_type")?;
    let period_type = period_type
        .parse()
        .map_err(|reason| StoreError::CorruptRow { id, reason })?;

    Ok(AnomalyRecord {
        id,
        group_value: row.try_get("group_value")?,
        group_field_name: row.try_get("group_field_name")?,
        period_type,
        object_type: row.try_get("object_type")?,
        object_id: row.try_get("object_id")?,
        object_name: row.try_get("object_name")?,
        district: row.try_get("district")?,
        comparison_mean: row.try_get("comparison_mean")?,
        recent_mean: row.try_get("recent_mean")?,
        difference: row.try_get("difference")?,
        std_dev: row.try_get("std_dev")?,
        out_of_bounds: row.try_get("out_of_bounds")?,
        comparison_dates: row.try_get("comparison_dates")?,
        comparison_counts: row.try_get("comparison_counts")?,
        recent_dates: row.try_get("recent_dates")?,
        recent_counts: row.try_get("recent_counts")?,
        metadata: row.try_get("metadata")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeriodType;
    use crate::query::QueryType;

    #[test]
    fn test_default_query_filters_active_anomalies() {
        let statement = build_select(&AnomalyQuery::default());
        assert!(statement.sql.ends_with(
            "FROM anomalies WHERE is_active AND out_of_bounds ORDER BY created_at DESC, id DESC"
        ));
        assert!(statement.params.is_empty());
    }

    #[test]
    fn test_every_filter_gets_its_own_placeholder() {
        let query = AnomalyQuery {
            query_type: QueryType::ByAnomalySeverity,
            limit: Some(25),
            group_filter: Some("mission".to_string()),
            metric_name: Some("burglary".to_string()),
            district: Some(9),
            metric_id: Some("17".to_string()),
            period_type: Some(PeriodType::Year),
            only_active: false,
            only_anomalies: false,
            ..AnomalyQuery::default()
        };
        let statement = build_select(&query);

        assert_eq!(statement.params.len(), 6);
        assert!(statement.sql.contains("WHERE group_value ILIKE $1 AND "));
        assert!(statement.sql.contains("(metadata->>'title' ILIKE $2 OR object_name ILIKE $2)"));
        assert!(statement.sql.contains("district = $3"));
        assert!(statement.sql.contains("object_id = $4"));
        assert!(statement.sql.contains("period_type = $5"));
        assert!(statement.sql.ends_with("ORDER BY ABS(difference) DESC, created_at DESC, id DESC LIMIT $6"));
        assert!(!statement.sql.contains("is_active AND"));
    }

    #[test]
    fn test_date_range_uses_half_open_interval() {
        let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 1);
        let end = chrono::NaiveDate::from_ymd_opt(2024, 1, 31);
        let query = AnomalyQuery::default().created_between(start, end);
        let statement = build_select(&query);

        assert!(statement.sql.contains("created_at >= $1 AND created_at < $2"));
        assert_eq!(statement.params.len(), 2);
    }
}
