//! Error types for the migration engine
//!
//! Per-migration execution failures are not errors at this level: they are
//! reported through [`MigrationResult`](crate::MigrationResult). `MigrateError`
//! covers everything that stops a command from running at all.

use thiserror::Error;

/// Result type alias for migration engine operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Error types for migration engine operations
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Database connection or statement error
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid user input (migration name, identifier, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Ledger table could not be created, read or written
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Another process holds the migration lock
    #[error("Migration lock on '{table}' is already held by {holder}")]
    LockHeld { table: String, holder: String },

    /// Rollback requested for a migration without a down section
    #[error("Migration {0} has no down migration section")]
    MissingDownSql(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        MigrateError::Database(err.to_string())
    }
}
