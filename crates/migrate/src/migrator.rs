//! Migrator - the command surface of the engine
//!
//! `up`, `down`, `status`, `create` and `ping`. Every call re-runs discovery,
//! so results always reflect the current state of the migration directories.

use chrono::{NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::backends::{detect_backend_from_url, redact_database_url, DatabaseBackendType, PostgresExecutor};
use crate::combiner::combine;
use crate::config::MigrationConfig;
use crate::definitions::{
    AppliedMigration, CombinedMigration, MigrationDirection, MigrationResult, MigrationScaffold,
    MigrationStatus,
};
use crate::discovery::{Discoverer, FileSystem};
use crate::error::{MigrateError, MigrateResult};
use crate::executor::{SimulatedExecutor, SqlExecutor};
use crate::ledger::{LedgerPort, MemoryLedger, SqlLedger};
use crate::runner::MigrationRunner;

/// Orchestrates discovery, the ledger and the runner
pub struct Migrator {
    config: MigrationConfig,
    discoverer: Discoverer,
    executor: Arc<dyn SqlExecutor>,
    ledger: Arc<dyn LedgerPort>,
    runner: MigrationRunner,
    lock_holder: String,
}

impl Migrator {
    /// Create a migrator from explicit collaborators
    pub fn new(
        config: MigrationConfig,
        executor: Arc<dyn SqlExecutor>,
        ledger: Arc<dyn LedgerPort>,
    ) -> Self {
        let runner = MigrationRunner::new(executor.clone(), ledger.clone());
        let lock_holder = format!(
            "{}@pid-{}",
            config.applied_by.as_deref().unwrap_or("tessera"),
            std::process::id()
        );
        Self {
            config,
            discoverer: Discoverer::new(),
            executor,
            ledger,
            runner,
            lock_holder,
        }
    }

    /// Build collaborators from configuration
    ///
    /// Simulation mode must be requested explicitly; a missing database URL
    /// is otherwise a configuration error.
    pub async fn connect(config: MigrationConfig) -> MigrateResult<Self> {
        config.validate()?;

        if config.simulate {
            tracing::warn!("Simulation mode: no SQL is executed and the ledger is in-memory only");
            let executor: Arc<dyn SqlExecutor> =
                Arc::new(SimulatedExecutor::new(config.simulate_delay()));
            let ledger: Arc<dyn LedgerPort> =
                Arc::new(MemoryLedger::new().with_applied_by(config.applied_by.clone()));
            return Ok(Self::new(config, executor, ledger));
        }

        let url = config.database_url.clone().ok_or_else(|| {
            MigrateError::Configuration("database_url is required outside simulation mode".to_string())
        })?;

        let executor: Arc<dyn SqlExecutor> = match detect_backend_from_url(&url)? {
            DatabaseBackendType::PostgreSQL => Arc::new(PostgresExecutor::connect(&url).await?),
        };
        tracing::info!(url = %redact_database_url(&url), table = %config.ledger_table, "Connected");

        let ledger: Arc<dyn LedgerPort> = Arc::new(
            SqlLedger::new(executor.clone(), &config.ledger_table)?
                .with_applied_by(config.applied_by.clone()),
        );
        Ok(Self::new(config, executor, ledger))
    }

    /// Migrator for filesystem-only work (`scaffold`, `create`, `discover`)
    ///
    /// Never touches a database; ledger-backed commands see an empty,
    /// in-memory ledger.
    pub fn offline(config: MigrationConfig) -> Self {
        let executor: Arc<dyn SqlExecutor> = Arc::new(SimulatedExecutor::new(Duration::ZERO));
        let ledger: Arc<dyn LedgerPort> = Arc::new(MemoryLedger::new());
        Self::new(config, executor, ledger)
    }

    /// Use a different filesystem for discovery
    pub fn with_filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.discoverer = Discoverer::with_filesystem(fs);
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn is_simulated(&self) -> bool {
        self.executor.is_simulated()
    }

    /// Discover and combine all migrations, sorted by version
    pub fn discover(&self) -> Vec<CombinedMigration> {
        combine(self.discoverer.discover(&self.config.sources))
    }

    /// Applied migrations, degrading to "nothing applied" if the ledger is unreadable
    async fn applied_or_empty(&self) -> Vec<AppliedMigration> {
        match self.ledger.applied().await {
            Ok(applied) => applied,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read ledger; treating all migrations as pending");
                Vec::new()
            }
        }
    }

    async fn lock(&self) -> MigrateResult<()> {
        if !self.config.lock {
            return Ok(());
        }
        if self
            .ledger
            .acquire_lock(&self.lock_holder, self.config.lock_lease())
            .await?
        {
            tracing::debug!(holder = %self.lock_holder, "Migration lock acquired");
            return Ok(());
        }
        let holder = self
            .ledger
            .lock_holder()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "another process".to_string());
        Err(MigrateError::LockHeld {
            table: self.config.ledger_table.clone(),
            holder,
        })
    }

    async fn unlock(&self) {
        if !self.config.lock {
            return;
        }
        if let Err(e) = self.ledger.release_lock(&self.lock_holder).await {
            tracing::warn!(error = %e, "Failed to release migration lock");
        }
    }

    /// Apply all pending migrations in version order, halting on first failure
    pub async fn up(&self) -> MigrateResult<Vec<MigrationResult>> {
        self.lock().await?;
        let results = self.up_locked().await;
        self.unlock().await;
        Ok(results)
    }

    async fn up_locked(&self) -> Vec<MigrationResult> {
        if let Err(e) = self.ledger.ensure_table().await {
            tracing::warn!(error = %e, "Could not ensure ledger table");
        }

        let discovered = self.discover();
        let applied = self.applied_or_empty().await;
        warn_on_drift(&discovered, &applied);

        let applied_versions: HashSet<&str> = applied.iter().map(|m| m.version.as_str()).collect();
        let pending: Vec<CombinedMigration> = discovered
            .into_iter()
            .filter(|m| !applied_versions.contains(m.version.as_str()))
            .collect();

        if pending.is_empty() {
            tracing::info!("No pending migrations");
            return Vec::new();
        }

        tracing::info!(count = pending.len(), "Applying pending migrations");
        self.runner.apply_all(&pending).await
    }

    /// Roll back the `steps` most recently applied versions, newest first
    pub async fn down(&self, steps: usize) -> MigrateResult<Vec<MigrationResult>> {
        self.lock().await?;
        let results = self.down_locked(steps).await;
        self.unlock().await;
        Ok(results)
    }

    async fn down_locked(&self, steps: usize) -> Vec<MigrationResult> {
        let mut applied = self.applied_or_empty().await;
        applied.sort_by(|a, b| b.version.cmp(&a.version));
        applied.truncate(steps);

        if applied.is_empty() {
            tracing::info!("Nothing to roll back");
            return Vec::new();
        }

        let discovered: HashMap<String, CombinedMigration> = self
            .discover()
            .into_iter()
            .map(|m| (m.version.clone(), m))
            .collect();

        let mut results = Vec::with_capacity(applied.len());
        for record in &applied {
            let result = match discovered.get(&record.version) {
                Some(migration) => self.runner.revert(migration).await,
                None => {
                    tracing::error!(version = %record.version, "Applied migration has no files on disk");
                    MigrationResult::failed(
                        &record.version,
                        record.description.clone().unwrap_or_default(),
                        MigrationDirection::Down,
                        Duration::ZERO,
                        MigrateError::NotFound(format!(
                            "migration files for applied version {}",
                            record.version
                        ))
                        .to_string(),
                    )
                }
            };

            let failed = !result.success;
            results.push(result);
            if failed {
                break;
            }
        }

        results
    }

    /// Discovered migrations merged with ledger state
    pub async fn status(&self) -> MigrateResult<Vec<MigrationStatus>> {
        let discovered = self.discover();
        let applied = self.applied_or_empty().await;

        let discovered_versions: HashSet<&str> =
            discovered.iter().map(|m| m.version.as_str()).collect();
        for orphan in applied
            .iter()
            .filter(|a| !discovered_versions.contains(a.version.as_str()))
        {
            tracing::warn!(version = %orphan.version, "Applied migration is no longer discovered");
        }

        let by_version: HashMap<&str, &AppliedMigration> =
            applied.iter().map(|a| (a.version.as_str(), a)).collect();

        Ok(discovered
            .iter()
            .map(|migration| {
                let record = by_version.get(migration.version.as_str());
                MigrationStatus {
                    version: migration.version.clone(),
                    name: migration.name.clone(),
                    applied: record.is_some(),
                    applied_at: record.map(|r| r.applied_at),
                    drifted: record.is_some_and(|r| is_drifted(migration, r)),
                }
            })
            .collect())
    }

    /// Build a new migration file name and template without writing anything
    pub fn scaffold(&self, name: &str) -> MigrateResult<MigrationScaffold> {
        self.scaffold_for_date(name, Utc::now().date_naive())
    }

    fn scaffold_for_date(&self, name: &str, date: NaiveDate) -> MigrateResult<MigrationScaffold> {
        let slug = sanitize_slug(name);
        if slug.is_empty() {
            return Err(MigrateError::Validation(format!(
                "Migration name '{}' has no usable characters",
                name
            )));
        }

        let dir = self.config.create_dir().ok_or_else(|| {
            MigrateError::Configuration("No migration source to create the file in".to_string())
        })?;

        let date_prefix = date.format("%Y%m%d").to_string();
        let next_sequence = self
            .discoverer
            .discover(&self.config.sources)
            .iter()
            .filter_map(|file| {
                let (date, sequence) = file.version.split_once('_')?;
                (date == date_prefix).then(|| sequence.parse::<u32>().ok()).flatten()
            })
            .max()
            .map_or(1, |max| max + 1);

        if next_sequence > 999 {
            return Err(MigrateError::Validation(format!(
                "No sequence numbers left for {}",
                date_prefix
            )));
        }

        let version = format!("{}_{:03}", date_prefix, next_sequence);
        let filename = format!("{}_{}.sql", version, slug);

        Ok(MigrationScaffold {
            template: migration_template(name, &version),
            path: dir.join(&filename),
            version,
            filename,
        })
    }

    /// Scaffold a migration and write it to the app migrations directory
    pub fn create(&self, name: &str) -> MigrateResult<MigrationScaffold> {
        let scaffold = self.scaffold(name)?;

        if let Some(dir) = scaffold.path.parent() {
            fs::create_dir_all(dir)?;
        }
        if scaffold.path.exists() {
            return Err(MigrateError::Validation(format!(
                "Migration file {} already exists",
                scaffold.path.display()
            )));
        }
        fs::write(&scaffold.path, &scaffold.template)?;

        tracing::info!(path = %scaffold.path.display(), "Created migration");
        Ok(scaffold)
    }

    /// Connectivity check
    pub async fn ping(&self) -> MigrateResult<Duration> {
        self.executor.ping().await
    }
}

fn is_drifted(migration: &CombinedMigration, record: &AppliedMigration) -> bool {
    record
        .checksum
        .as_deref()
        .is_some_and(|recorded| recorded != migration.checksum())
}

fn warn_on_drift(discovered: &[CombinedMigration], applied: &[AppliedMigration]) {
    let by_version: HashMap<&str, &AppliedMigration> =
        applied.iter().map(|a| (a.version.as_str(), a)).collect();

    for migration in discovered {
        if let Some(record) = by_version.get(migration.version.as_str()) {
            if is_drifted(migration, record) {
                tracing::warn!(
                    version = %migration.version,
                    "Applied migration has changed on disk since it was applied"
                );
            }
        }
    }
}

/// Lowercase, with every run of non-alphanumerics collapsed to `_`
pub fn sanitize_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

fn migration_template(name: &str, version: &str) -> String {
    format!(
        "-- Migration: {}\n\
         -- Version: {}\n\
         -- Created: {}\n\n\
         -- Up migration\n\n\n\
         -- Down migration\n\n",
        name,
        version,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}
