//! Applied-Version Ledger
//!
//! Tracks which versions have been applied. The engine only sees the
//! [`LedgerPort`] trait; [`SqlLedger`] persists to a table through the
//! [`SqlExecutor`] port and [`MemoryLedger`] keeps rows in memory for
//! simulation mode and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::definitions::AppliedMigration;
use crate::error::{MigrateError, MigrateResult};
use crate::executor::{SqlExecutor, SqlValue};
use crate::security::quote_table_name;

/// Default name of the ledger table
pub const DEFAULT_LEDGER_TABLE: &str = "schema_migrations";

/// Persistence port for applied migrations
#[async_trait]
pub trait LedgerPort: Send + Sync {
    /// Create the ledger if it does not exist. Safe to call on every run.
    async fn ensure_table(&self) -> MigrateResult<()>;

    /// All applied migrations ordered by `applied_at` ascending
    async fn applied(&self) -> MigrateResult<Vec<AppliedMigration>>;

    /// Record a version as applied. Recording an existing version is a no-op.
    async fn record(
        &self,
        version: &str,
        description: &str,
        checksum: Option<&str>,
    ) -> MigrateResult<()>;

    /// Forget a version after it has been rolled back
    async fn remove(&self, version: &str) -> MigrateResult<()>;

    /// Take the advisory migration lock; `false` if someone else holds it
    ///
    /// A lock taken more than `lease` ago is stale and is taken over, so a
    /// runner killed before releasing does not block later runs forever.
    async fn acquire_lock(&self, holder: &str, lease: Duration) -> MigrateResult<bool>;

    /// Release the advisory lock if `holder` owns it
    async fn release_lock(&self, holder: &str) -> MigrateResult<()>;

    /// Current lock holder, if any
    async fn lock_holder(&self) -> MigrateResult<Option<String>>;
}

/// Table-backed ledger
pub struct SqlLedger {
    executor: Arc<dyn SqlExecutor>,
    table: String,
    lock_table: String,
    applied_by: Option<String>,
}

impl SqlLedger {
    /// Ledger stored in `table`; the lock lives in `<table>_lock`
    pub fn new(executor: Arc<dyn SqlExecutor>, table: &str) -> MigrateResult<Self> {
        let lock_table = quote_table_name(&format!("{}_lock", table))?;
        Ok(Self {
            executor,
            table: quote_table_name(table)?,
            lock_table,
            applied_by: None,
        })
    }

    /// Actor stored in `applied_by` for every recorded row
    pub fn with_applied_by(mut self, applied_by: Option<String>) -> Self {
        self.applied_by = applied_by;
        self
    }

    /// SQL to create the ledger table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version TEXT PRIMARY KEY,\n    \
                description TEXT,\n    \
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    \
                applied_by TEXT NULL,\n    \
                checksum TEXT NULL\n\
            )",
            self.table
        )
    }

    /// SQL to create the lock table
    pub fn create_lock_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id INTEGER PRIMARY KEY,\n    \
                holder TEXT NOT NULL,\n    \
                acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\n\
            )",
            self.lock_table
        )
    }

    /// SQL to take the lock, or take over a lock older than `$2` seconds
    ///
    /// Affects one row when the lock was taken and none when it is held.
    pub fn acquire_lock_sql(&self) -> String {
        format!(
            "INSERT INTO {} AS held (id, holder, acquired_at) VALUES (1, $1, NOW()) \
             ON CONFLICT (id) DO UPDATE SET holder = EXCLUDED.holder, acquired_at = EXCLUDED.acquired_at \
             WHERE held.acquired_at < NOW() - make_interval(secs => $2)",
            self.lock_table
        )
    }

    /// SQL to read all ledger rows
    pub fn applied_sql(&self) -> String {
        format!(
            "SELECT version, description, applied_at, applied_by, checksum FROM {} \
             ORDER BY applied_at ASC, version ASC",
            self.table
        )
    }

    /// SQL to record a migration, ignoring duplicates
    pub fn record_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, description, applied_by, checksum) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (version) DO NOTHING",
            self.table
        )
    }

    /// SQL to remove a migration record (for rollback)
    pub fn remove_sql(&self) -> String {
        format!("DELETE FROM {} WHERE version = $1", self.table)
    }

    fn ledger_err(context: &str, err: MigrateError) -> MigrateError {
        MigrateError::Ledger(format!("{}: {}", context, err))
    }
}

#[async_trait]
impl LedgerPort for SqlLedger {
    async fn ensure_table(&self) -> MigrateResult<()> {
        self.executor
            .execute(&self.create_table_sql(), &[])
            .await
            .map_err(|e| Self::ledger_err("Failed to create ledger table", e))?;
        Ok(())
    }

    async fn applied(&self) -> MigrateResult<Vec<AppliedMigration>> {
        let rows = self
            .executor
            .fetch_all(&self.applied_sql(), &[])
            .await
            .map_err(|e| Self::ledger_err("Failed to query applied migrations", e))?;

        rows.into_iter()
            .map(|row| {
                Ok(AppliedMigration {
                    version: row.get_string("version")?,
                    description: row.get_optional_string("description")?,
                    applied_at: row.get_datetime("applied_at")?,
                    applied_by: row.get_optional_string("applied_by")?,
                    checksum: row.get_optional_string("checksum")?,
                })
            })
            .collect()
    }

    async fn record(
        &self,
        version: &str,
        description: &str,
        checksum: Option<&str>,
    ) -> MigrateResult<()> {
        let params = [
            SqlValue::from(version),
            SqlValue::from(description),
            SqlValue::from(self.applied_by.clone()),
            SqlValue::from(checksum),
        ];
        self.executor
            .execute(&self.record_sql(), &params)
            .await
            .map_err(|e| Self::ledger_err("Failed to record migration", e))?;
        Ok(())
    }

    async fn remove(&self, version: &str) -> MigrateResult<()> {
        self.executor
            .execute(&self.remove_sql(), &[SqlValue::from(version)])
            .await
            .map_err(|e| Self::ledger_err("Failed to remove migration record", e))?;
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, lease: Duration) -> MigrateResult<bool> {
        self.executor
            .execute(&self.create_lock_table_sql(), &[])
            .await
            .map_err(|e| Self::ledger_err("Failed to create lock table", e))?;

        let lease_secs = i64::try_from(lease.as_secs()).unwrap_or(i64::MAX);
        let affected = self
            .executor
            .execute(
                &self.acquire_lock_sql(),
                &[SqlValue::from(holder), SqlValue::from(lease_secs)],
            )
            .await
            .map_err(|e| Self::ledger_err("Failed to acquire migration lock", e))?;

        Ok(affected == 1)
    }

    async fn release_lock(&self, holder: &str) -> MigrateResult<()> {
        let sql = format!("DELETE FROM {} WHERE id = 1 AND holder = $1", self.lock_table);
        self.executor
            .execute(&sql, &[SqlValue::from(holder)])
            .await
            .map_err(|e| Self::ledger_err("Failed to release migration lock", e))?;
        Ok(())
    }

    async fn lock_holder(&self) -> MigrateResult<Option<String>> {
        let sql = format!("SELECT holder FROM {} WHERE id = 1", self.lock_table);
        let rows = self
            .executor
            .fetch_all(&sql, &[])
            .await
            .map_err(|e| Self::ledger_err("Failed to read migration lock", e))?;
        match rows.first() {
            Some(row) => row.get_optional_string("holder"),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<AppliedMigration>,
    lock: Option<(String, DateTime<Utc>)>,
}

/// In-memory ledger
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
    applied_by: Option<String>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_applied_by(mut self, applied_by: Option<String>) -> Self {
        self.applied_by = applied_by;
        self
    }

    /// Ledger pre-populated with `rows`
    pub fn with_rows(rows: Vec<AppliedMigration>) -> Self {
        Self {
            state: Mutex::new(MemoryState { rows, lock: None }),
            applied_by: None,
        }
    }

    fn state(&self) -> MigrateResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| MigrateError::Ledger("In-memory ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerPort for MemoryLedger {
    async fn ensure_table(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn applied(&self) -> MigrateResult<Vec<AppliedMigration>> {
        let mut rows = self.state()?.rows.clone();
        rows.sort_by(|a, b| {
            a.applied_at
                .cmp(&b.applied_at)
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(rows)
    }

    async fn record(
        &self,
        version: &str,
        description: &str,
        checksum: Option<&str>,
    ) -> MigrateResult<()> {
        let mut state = self.state()?;
        if state.rows.iter().any(|row| row.version == version) {
            return Ok(());
        }
        state.rows.push(AppliedMigration {
            version: version.to_string(),
            description: Some(description.to_string()),
            applied_at: Utc::now(),
            applied_by: self.applied_by.clone(),
            checksum: checksum.map(str::to_string),
        });
        Ok(())
    }

    async fn remove(&self, version: &str) -> MigrateResult<()> {
        self.state()?.rows.retain(|row| row.version != version);
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, lease: Duration) -> MigrateResult<bool> {
        let mut state = self.state()?;
        let now = Utc::now();

        if let Some((current, acquired_at)) = &state.lock {
            let stale = (now - *acquired_at).to_std().is_ok_and(|age| age >= lease);
            if !stale {
                return Ok(false);
            }
            tracing::warn!(holder = %current, acquired_at = %acquired_at, "Taking over stale migration lock");
        }

        state.lock = Some((holder.to_string(), now));
        Ok(true)
    }

    async fn release_lock(&self, holder: &str) -> MigrateResult<()> {
        let mut state = self.state()?;
        if state.lock.as_ref().is_some_and(|(current, _)| current == holder) {
            state.lock = None;
        }
        Ok(())
    }

    async fn lock_holder(&self) -> MigrateResult<Option<String>> {
        Ok(self.state()?.lock.as_ref().map(|(holder, _)| holder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SqlRow;
    use std::time::Duration;

    /// Records every statement and returns canned rows
    #[derive(Default)]
    struct RecordingExecutor {
        statements: Mutex<Vec<(String, Vec<SqlValue>)>>,
        rows: Vec<SqlRow>,
    }

    #[async_trait]
    impl SqlExecutor for RecordingExecutor {
        async fn execute_script(&self, sql: &str) -> MigrateResult<()> {
            self.statements.lock().unwrap().push((sql.to_string(), Vec::new()));
            Ok(())
        }

        async fn execute(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
            self.statements.lock().unwrap().push((sql.to_string(), params.to_vec()));
            Ok(1)
        }

        async fn fetch_all(&self, _sql: &str, _params: &[SqlValue]) -> MigrateResult<Vec<SqlRow>> {
            Ok(self.rows.clone())
        }

        async fn ping(&self) -> MigrateResult<Duration> {
            Ok(Duration::ZERO)
        }
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let ledger = MemoryLedger::new();
        ledger.record("20240101_001", "users", Some("abc")).await.unwrap();
        ledger.record("20240101_001", "users", Some("abc")).await.unwrap();

        let applied = ledger.applied().await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].version, "20240101_001");
        assert_eq!(applied[0].checksum.as_deref(), Some("abc"));
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_memory_lock() {
        let ledger = MemoryLedger::new();
        assert!(ledger.acquire_lock("a", HOUR).await.unwrap());
        assert!(!ledger.acquire_lock("b", HOUR).await.unwrap());
        assert_eq!(ledger.lock_holder().await.unwrap().as_deref(), Some("a"));

        // only the holder can release
        ledger.release_lock("b").await.unwrap();
        assert!(!ledger.acquire_lock("b", HOUR).await.unwrap());

        ledger.release_lock("a").await.unwrap();
        assert!(ledger.acquire_lock("b", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_lock_stale_takeover() {
        let ledger = MemoryLedger::new();
        assert!(ledger.acquire_lock("crashed", HOUR).await.unwrap());

        // still within the lease for a one-hour caller
        assert!(!ledger.acquire_lock("next", HOUR).await.unwrap());

        // a zero lease treats any existing lock as expired
        assert!(ledger.acquire_lock("next", Duration::ZERO).await.unwrap());
        assert_eq!(ledger.lock_holder().await.unwrap().as_deref(), Some("next"));

        // the old holder can no longer release it
        ledger.release_lock("crashed").await.unwrap();
        assert_eq!(ledger.lock_holder().await.unwrap().as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_sql_ledger_lock_binds_lease() {
        let executor = Arc::new(RecordingExecutor::default());
        let ledger = SqlLedger::new(executor.clone(), DEFAULT_LEDGER_TABLE).unwrap();

        assert!(ledger.acquire_lock("ci@pid-7", Duration::from_secs(900)).await.unwrap());

        let statements = executor.statements.lock().unwrap();
        assert!(statements[0].0.contains("CREATE TABLE IF NOT EXISTS \"schema_migrations_lock\""));
        let (sql, params) = &statements[1];
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE"));
        assert!(sql.contains("WHERE held.acquired_at < NOW() - make_interval(secs => $2)"));
        assert_eq!(params, &vec![SqlValue::from("ci@pid-7"), SqlValue::from(900i64)]);
    }

    #[tokio::test]
    async fn test_remove() {
        let ledger = MemoryLedger::new();
        ledger.record("20240101_001", "a", None).await.unwrap();
        ledger.record("20240101_002", "b", None).await.unwrap();
        ledger.remove("20240101_002").await.unwrap();

        let versions: Vec<String> = ledger.applied().await.unwrap().into_iter().map(|m| m.version).collect();
        assert_eq!(versions, vec!["20240101_001"]);
    }

    #[test]
    fn test_sql_ledger_rejects_bad_table_name() {
        let executor: Arc<dyn SqlExecutor> = Arc::new(RecordingExecutor::default());
        assert!(SqlLedger::new(executor.clone(), "migrations; DROP TABLE users").is_err());
        assert!(SqlLedger::new(executor, "public.schema_migrations").is_ok());
    }

    #[test]
    fn test_sql_ledger_statements() {
        let executor: Arc<dyn SqlExecutor> = Arc::new(RecordingExecutor::default());
        let ledger = SqlLedger::new(executor, DEFAULT_LEDGER_TABLE).unwrap();

        let create = ledger.create_table_sql();
        assert!(create.contains("CREATE TABLE IF NOT EXISTS \"schema_migrations\""));
        assert!(create.contains("version TEXT PRIMARY KEY"));
        assert!(create.contains("applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()"));

        assert!(ledger.record_sql().contains("ON CONFLICT (version) DO NOTHING"));
        assert!(ledger.applied_sql().contains("ORDER BY applied_at ASC"));
        assert!(ledger.create_lock_table_sql().contains("\"schema_migrations_lock\""));
    }

    #[tokio::test]
    async fn test_sql_ledger_binds_parameters() {
        let executor = Arc::new(RecordingExecutor::default());
        let ledger = SqlLedger::new(executor.clone(), DEFAULT_LEDGER_TABLE)
            .unwrap()
            .with_applied_by(Some("ci".to_string()));

        ledger.record("20240101_001", "users", None).await.unwrap();

        let statements = executor.statements.lock().unwrap();
        let (sql, params) = &statements[0];
        assert!(sql.starts_with("INSERT INTO \"schema_migrations\""));
        assert_eq!(
            params,
            &vec![
                SqlValue::from("20240101_001"),
                SqlValue::from("users"),
                SqlValue::from("ci"),
                SqlValue::Null,
            ]
        );
    }

    #[tokio::test]
    async fn test_sql_ledger_reads_rows() {
        let now = Utc::now();
        let executor = Arc::new(RecordingExecutor {
            statements: Mutex::new(Vec::new()),
            rows: vec![SqlRow::new()
                .with("version", "20240101_001")
                .with("description", "users")
                .with("applied_at", now)
                .with("applied_by", SqlValue::Null)
                .with("checksum", "abc")],
        });
        let ledger = SqlLedger::new(executor, DEFAULT_LEDGER_TABLE).unwrap();

        let applied = ledger.applied().await.unwrap();
        assert_eq!(
            applied,
            vec![AppliedMigration {
                version: "20240101_001".to_string(),
                description: Some("users".to_string()),
                applied_at: now,
                applied_by: None,
                checksum: Some("abc".to_string()),
            }]
        );
    }
}
