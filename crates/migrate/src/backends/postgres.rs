//! PostgreSQL Backend Implementation
//!
//! [`SqlExecutor`] over a `sqlx` Postgres pool. Migration bodies run through
//! the simple-query protocol inside a transaction, so a body may contain
//! several statements and is applied all-or-nothing.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, PgPool, Postgres, Row, TypeInfo};
use std::time::{Duration, Instant};

use super::redact_database_url;
use crate::error::{MigrateError, MigrateResult};
use crate::executor::{SqlExecutor, SqlRow, SqlValue};

/// A single sequential runner needs very few connections
const MAX_CONNECTIONS: u32 = 2;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL executor
#[derive(Debug, Clone)]
pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a small pool to `database_url`
    pub async fn connect(database_url: &str) -> MigrateResult<Self> {
        tracing::debug!(url = %redact_database_url(database_url), "Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to connect to database: {}", e)))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    async fn execute_script(&self, sql: &str) -> MigrateResult<()> {
        let mut transaction = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to start transaction: {}", e)))?;

        // A bare &str carries no arguments, so sqlx sends it as a simple query
        // and Postgres accepts several statements in one round-trip.
        (&mut *transaction)
            .execute(sql)
            .await
            .map_err(|e| MigrateError::Database(e.to_string()))?;

        transaction
            .commit()
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to commit migration: {}", e)))?;

        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| MigrateError::Database(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<SqlRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::Database(format!("Query fetch failed: {}", e)))?;

        rows.iter().map(to_sql_row).collect()
    }

    async fn ping(&self) -> MigrateResult<Duration> {
        let start = Instant::now();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| MigrateError::Database(format!("Health check failed: {}", e)))?;

        Ok(start.elapsed())
    }
}

/// Bind a SqlValue to a sqlx query
fn bind_value<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int64(i) => query.bind(*i),
        SqlValue::String(s) => query.bind(s.clone()),
        SqlValue::DateTime(dt) => query.bind(*dt),
    }
}

fn to_sql_row(row: &PgRow) -> MigrateResult<SqlRow> {
    let mut sql_row = SqlRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        sql_row.insert(column.name(), decode_column(row, index)?);
    }
    Ok(sql_row)
}

/// Convert a PostgreSQL column value to SqlValue
fn decode_column(row: &PgRow, index: usize) -> MigrateResult<SqlValue> {
    let type_name = row.columns()[index].type_info().name().to_string();

    let decoded = match type_name.as_str() {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map(SqlValue::Bool)),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map(|v| v.map(|i| SqlValue::Int64(i as i64))),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map(|i| SqlValue::Int64(i as i64))),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .map(|v| v.map(SqlValue::Int64)),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map(|v| v.map(SqlValue::DateTime)),
        "TIMESTAMP" => row.try_get::<Option<NaiveDateTime>, _>(index).map(|v| {
            v.map(|naive| SqlValue::DateTime(DateTime::from_naive_utc_and_offset(naive, Utc)))
        }),
        _ => row
            .try_get::<Option<String>, _>(index)
            .map(|v| v.map(SqlValue::String)),
    };

    decoded
        .map(|value| value.unwrap_or(SqlValue::Null))
        .map_err(|e| {
            MigrateError::Database(format!(
                "Failed to decode column {} of type {}: {}",
                index, type_name, e
            ))
        })
}
