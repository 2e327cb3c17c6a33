//! Migration Runner - Executes migrations against the database
//!
//! Migrations run strictly one at a time in the order given. A batch stops at
//! the first failure, so the ledger always holds a prefix of the sorted
//! version sequence.

use std::sync::Arc;
use std::time::Instant;

use crate::definitions::{CombinedMigration, MigrationDirection, MigrationResult};
use crate::error::MigrateError;
use crate::executor::SqlExecutor;
use crate::ledger::LedgerPort;

/// Outcome of running one SQL body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error: Option<String>,
}

/// Executes combined migrations and keeps the ledger in step
#[derive(Clone)]
pub struct MigrationRunner {
    executor: Arc<dyn SqlExecutor>,
    ledger: Arc<dyn LedgerPort>,
}

impl MigrationRunner {
    pub fn new(executor: Arc<dyn SqlExecutor>, ledger: Arc<dyn LedgerPort>) -> Self {
        Self { executor, ledger }
    }

    /// Run a SQL body, folding any error into the outcome
    pub async fn execute(&self, sql: &str) -> ExecutionOutcome {
        match self.executor.execute_script(sql).await {
            Ok(()) => ExecutionOutcome {
                success: true,
                error: None,
            },
            Err(e) => ExecutionOutcome {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Apply one migration and record it in the ledger
    pub async fn apply(&self, migration: &CombinedMigration) -> MigrationResult {
        tracing::info!(version = %migration.version, name = %migration.name, "Applying migration");
        let start = Instant::now();

        let outcome = self.execute(&migration.combined_sql).await;
        if !outcome.success {
            let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            tracing::error!(version = %migration.version, error = %error, "Migration failed");
            return MigrationResult::failed(
                &migration.version,
                &migration.name,
                MigrationDirection::Up,
                start.elapsed(),
                error,
            );
        }

        let checksum = migration.checksum();
        if let Err(e) = self
            .ledger
            .record(&migration.version, &migration.name, Some(&checksum))
            .await
        {
            tracing::error!(
                version = %migration.version,
                error = %e,
                "Migration SQL succeeded but could not be recorded"
            );
            return MigrationResult::failed(
                &migration.version,
                &migration.name,
                MigrationDirection::Up,
                start.elapsed(),
                format!("SQL executed but not recorded in ledger: {}", e),
            );
        }

        let duration = start.elapsed();
        tracing::info!(
            version = %migration.version,
            duration_ms = duration.as_millis() as u64,
            "Migration applied"
        );
        MigrationResult::succeeded(migration, MigrationDirection::Up, duration)
    }

    /// Apply migrations in order, stopping at the first failure
    pub async fn apply_all(&self, pending: &[CombinedMigration]) -> Vec<MigrationResult> {
        let mut results = Vec::with_capacity(pending.len());

        for migration in pending {
            let result = self.apply(migration).await;
            let failed = !result.success;
            results.push(result);

            if failed {
                let skipped = pending.len() - results.len();
                if skipped > 0 {
                    tracing::warn!(skipped, "Halting: remaining pending migrations were not attempted");
                }
                break;
            }
        }

        results
    }

    /// Run a migration's down SQL and remove it from the ledger
    pub async fn revert(&self, migration: &CombinedMigration) -> MigrationResult {
        let start = Instant::now();

        let Some(down_sql) = migration.down_sql.as_deref() else {
            let error = MigrateError::MissingDownSql(migration.version.clone());
            tracing::error!(version = %migration.version, "Cannot roll back: no down migration");
            return MigrationResult::failed(
                &migration.version,
                &migration.name,
                MigrationDirection::Down,
                start.elapsed(),
                error.to_string(),
            );
        };

        tracing::info!(version = %migration.version, name = %migration.name, "Rolling back migration");

        let outcome = self.execute(down_sql).await;
        if !outcome.success {
            let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            tracing::error!(version = %migration.version, error = %error, "Rollback failed");
            return MigrationResult::failed(
                &migration.version,
                &migration.name,
                MigrationDirection::Down,
                start.elapsed(),
                error,
            );
        }

        if let Err(e) = self.ledger.remove(&migration.version).await {
            tracing::error!(version = %migration.version, error = %e, "Rollback succeeded but ledger row remains");
            return MigrationResult::failed(
                &migration.version,
                &migration.name,
                MigrationDirection::Down,
                start.elapsed(),
                format!("Down SQL executed but ledger row not removed: {}", e),
            );
        }

        let duration = start.elapsed();
        tracing::info!(
            version = %migration.version,
            duration_ms = duration.as_millis() as u64,
            "Migration rolled back"
        );
        MigrationResult::succeeded(migration, MigrationDirection::Down, duration)
    }
}
