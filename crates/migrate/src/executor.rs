//! SQL Executor Port
//!
//! The engine never talks to a database driver directly. Migration bodies and
//! ledger statements go through [`SqlExecutor`], which the Postgres backend
//! and the simulated executor implement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{MigrateError, MigrateResult};

/// Abstract SQL executor
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a migration body (possibly several statements) as one unit
    async fn execute_script(&self, sql: &str) -> MigrateResult<()>;

    /// Execute a parameterised statement and return the affected row count
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64>;

    /// Execute a parameterised query and return all rows
    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<SqlRow>>;

    /// Round-trip to the database and report the latency
    async fn ping(&self) -> MigrateResult<Duration>;

    /// True when nothing is actually sent to a database
    fn is_simulated(&self) -> bool {
        false
    }
}

/// Parameter and column values used by the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int64(i64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::String(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int64(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::DateTime(value)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

/// A result row keyed by column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: HashMap<String, SqlValue>,
}

impl SqlRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.columns.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    /// Required text column
    pub fn get_string(&self, column: &str) -> MigrateResult<String> {
        self.get_optional_string(column)?
            .ok_or_else(|| MigrateError::Ledger(format!("Column '{}' is NULL", column)))
    }

    /// Nullable text column; a missing column reads as NULL
    pub fn get_optional_string(&self, column: &str) -> MigrateResult<Option<String>> {
        match self.columns.get(column) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(SqlValue::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(MigrateError::Ledger(format!(
                "Column '{}' is not text: {:?}",
                column, other
            ))),
        }
    }

    /// Required timestamp column; RFC 3339 text is accepted as well
    pub fn get_datetime(&self, column: &str) -> MigrateResult<DateTime<Utc>> {
        match self.columns.get(column) {
            Some(SqlValue::DateTime(dt)) => Ok(*dt),
            Some(SqlValue::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    MigrateError::Ledger(format!("Column '{}' is not a timestamp: {}", column, e))
                }),
            other => Err(MigrateError::Ledger(format!(
                "Column '{}' is not a timestamp: {:?}",
                column, other
            ))),
        }
    }
}

/// Executor used in simulation mode; nothing reaches a database
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    delay: Duration,
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl SqlExecutor for SimulatedExecutor {
    async fn execute_script(&self, sql: &str) -> MigrateResult<()> {
        tracing::debug!(bytes = sql.len(), "Simulating migration execution");
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn execute(&self, _sql: &str, _params: &[SqlValue]) -> MigrateResult<u64> {
        Ok(0)
    }

    async fn fetch_all(&self, _sql: &str, _params: &[SqlValue]) -> MigrateResult<Vec<SqlRow>> {
        Ok(Vec::new())
    }

    async fn ping(&self) -> MigrateResult<Duration> {
        let start = Instant::now();
        tokio::time::sleep(self.delay).await;
        Ok(start.elapsed())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}
