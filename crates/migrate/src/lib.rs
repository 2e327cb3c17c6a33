//! # tessera-migrate
//!
//! Versioned SQL migration engine for monorepos. Migration fragments for the
//! same `YYYYMMDD_NNN` version can live in several directories (an app's own
//! migrations plus shared package migrations); they are merged by version in
//! priority order and applied as one unit.
//!
//! ```no_run
//! use tessera_migrate::{MigrationConfig, Migrator};
//!
//! # async fn run() -> tessera_migrate::MigrateResult<()> {
//! let mut config = MigrationConfig::for_app(".", "web");
//! config.apply_env()?;
//!
//! let migrator = Migrator::connect(config).await?;
//! for result in migrator.up().await? {
//!     println!("{} {}", result.version, result.success);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod combiner;
pub mod config;
pub mod definitions;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod migrator;
pub mod runner;
pub mod security;

pub use combiner::combine;
pub use config::MigrationConfig;
pub use definitions::*;
pub use discovery::{Discoverer, FileSystem, LocalFileSystem};
pub use error::{MigrateError, MigrateResult};
pub use executor::{SimulatedExecutor, SqlExecutor, SqlRow, SqlValue};
pub use ledger::{LedgerPort, MemoryLedger, SqlLedger};
pub use migrator::Migrator;
pub use runner::{ExecutionOutcome, MigrationRunner};
