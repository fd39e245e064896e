/// Database connection and schema helpers.

use std::env;

use postgres::{Client, NoTls};
use thiserror::Error;

/// Schema for the `anomalies` table and its indexes. Idempotent.
pub const SCHEMA_SQL: &str = include_str!("../sql/001_anomalies.sql");

#[derive(Debug, Error)]
pub enum DbError {
    #[error("DATABASE_URL must be set (in the environment or .env)")]
    MissingUrl,
    #[error("database error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("missing tables: {}. Apply sql/001_anomalies.sql first", .0.join(", "))]
    MissingTables(Vec<String>),
}

pub fn connect(database_url: &str) -> Result<Client, DbError> {
    Ok(Client::connect(database_url, NoTls)?)
}

/// Connects using `DATABASE_URL`, loading `.env` first if present.
pub fn connect_from_env() -> Result<Client, DbError> {
    dotenv::dotenv().ok();
    let database_url = env::var("DATABASE_URL").map_err(|_| DbError::MissingUrl)?;
    connect(&database_url)
}

pub fn apply_schema(client: &mut Client) -> Result<(), DbError> {
    client.batch_execute(SCHEMA_SQL)?;
    tracing::info!("anomaly schema applied");
    Ok(())
}

/// Connects and checks that every table in `tables` exists.
pub fn connect_and_verify(database_url: &str, tables: &[&str]) -> Result<Client, DbError> {
    let mut client = connect(database_url)?;

    let mut missing = Vec::new();
    for table in tables {
        let row = client.query_one("SELECT to_regclass($1) IS NOT NULL", &[table])?;
        if !row.try_get::<_, bool>(0)? {
            missing.push(table.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(DbError::MissingTables(missing));
    }

    tracing::debug!(tables = tables.len(), "database schema verified");
    Ok(client)
}
