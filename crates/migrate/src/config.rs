//! Migration configuration
//!
//! Loaded from YAML, then overridden from the environment, then validated.

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::definitions::{MigrationSource, SourceKind};
use crate::error::{MigrateError, MigrateResult};
use crate::ledger::DEFAULT_LEDGER_TABLE;
use crate::security::validate_table_name;

/// Configuration for the migration engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    /// Discovery roots, in any order; `priority` decides fragment order
    pub sources: Vec<MigrationSource>,
    #[serde(default = "default_ledger_table")]
    pub ledger_table: String,
    #[serde(default)]
    pub database_url: Option<String>,
    /// Explicit opt-in for running without a database
    #[serde(default)]
    pub simulate: bool,
    #[serde(default = "default_simulate_delay_ms")]
    pub simulate_delay_ms: u64,
    /// Stored in the ledger's `applied_by` column
    #[serde(default)]
    pub applied_by: Option<String>,
    /// Take the advisory lock around `up` and `down`
    #[serde(default = "default_lock")]
    pub lock: bool,
    /// Seconds after which a lock left behind by a dead runner is taken over
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

fn default_ledger_table() -> String {
    DEFAULT_LEDGER_TABLE.to_string()
}

fn default_simulate_delay_ms() -> u64 {
    100
}

fn default_lock() -> bool {
    true
}

fn default_lock_lease_secs() -> u64 {
    15 * 60
}

impl MigrationConfig {
    /// Configuration with the given sources and defaults for everything else
    pub fn new(sources: Vec<MigrationSource>) -> Self {
        Self {
            sources,
            ledger_table: default_ledger_table(),
            database_url: None,
            simulate: false,
            simulate_delay_ms: default_simulate_delay_ms(),
            applied_by: None,
            lock: default_lock(),
            lock_lease_secs: default_lock_lease_secs(),
        }
    }

    /// Monorepo layout: app migrations, then common package migrations,
    /// then package migrations scoped to the app
    pub fn for_app(root: impl AsRef<Path>, app: &str) -> Self {
        let root = root.as_ref();
        let package_root = root.join("packages").join("database").join("migrations");
        Self::new(vec![
            MigrationSource::new(root.join("apps").join(app).join("migrations"), SourceKind::App, 1),
            MigrationSource::new(package_root.join("common"), SourceKind::Package, 2),
            MigrationSource::new(package_root.join("apps").join(app), SourceKind::Package, 3),
        ])
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MigrateError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml_str(&content)?;

        // Relative source paths are relative to the config file
        if let Some(base) = path.parent() {
            for source in &mut config.sources {
                if source.path.is_relative() {
                    source.path = base.join(&source.path);
                }
            }
        }
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> MigrateResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment variable overrides
    pub fn apply_env(&mut self) -> MigrateResult<()> {
        self.apply_env_from(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> MigrateResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database_url = Some(url);
        }

        if let Some(table) = lookup("TESSERA_LEDGER_TABLE").filter(|v| !v.is_empty()) {
            self.ledger_table = table;
        }

        if let Some(simulate) = lookup("TESSERA_SIMULATE") {
            self.simulate = parse_flag("TESSERA_SIMULATE", &simulate)?;
        }

        if self.applied_by.is_none() {
            self.applied_by = lookup("TESSERA_APPLIED_BY").or_else(|| lookup("USER"));
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> MigrateResult<()> {
        if self.sources.is_empty() {
            return Err(MigrateError::Configuration(
                "At least one migration source must be configured".to_string(),
            ));
        }

        validate_table_name(&self.ledger_table)
            .map_err(|e| MigrateError::Configuration(format!("Invalid ledger_table: {}", e)))?;

        // The lock lives in `<ledger_table>_lock`, which must be a valid name too
        validate_table_name(&format!("{}_lock", self.ledger_table)).map_err(|e| {
            MigrateError::Configuration(format!(
                "ledger_table '{}' is too long to derive its lock table: {}",
                self.ledger_table, e
            ))
        })?;

        if !self.simulate && self.database_url.is_none() {
            return Err(MigrateError::Configuration(
                "No database_url configured; set DATABASE_URL or enable simulation mode explicitly"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn simulate_delay(&self) -> Duration {
        Duration::from_millis(self.simulate_delay_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    /// Directory `create` writes into: first app source, else first source
    pub fn create_dir(&self) -> Option<&PathBuf> {
        self.sources
            .iter()
            .find(|s| s.kind == SourceKind::App)
            .or_else(|| self.sources.first())
            .map(|s| &s.path)
    }
}

fn parse_flag(field: &str, value: &str) -> MigrateResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(MigrateError::Configuration(format!(
            "Invalid value '{}' for {} (expected true or false)",
            value, field
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_for_app_layout() {
        let config = MigrationConfig::for_app("/repo", "particle0");
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[0].path, PathBuf::from("/repo/apps/particle0/migrations"));
        assert_eq!(config.sources[0].kind, SourceKind::App);
        assert_eq!(config.sources[1].path, PathBuf::from("/repo/packages/database/migrations/common"));
        assert_eq!(config.sources[2].priority, 3);
        assert_eq!(config.ledger_table, "schema_migrations");
        assert!(config.lock);
        assert_eq!(config.lock_lease(), Duration::from_secs(900));
        assert_eq!(config.create_dir(), Some(&PathBuf::from("/repo/apps/particle0/migrations")));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
sources:
  - path: app/migrations
    kind: app
    priority: 1
  - path: shared/migrations
    kind: package
    priority: 2
ledger_table: public.migration_log
simulate: true
lock_lease_secs: 120
"#;
        let config = MigrationConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.sources[1].kind, SourceKind::Package);
        assert_eq!(config.ledger_table, "public.migration_log");
        assert!(config.simulate);
        assert_eq!(config.simulate_delay_ms, 100);
        assert_eq!(config.lock_lease_secs, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_yaml_fields_rejected() {
        let yaml = "sources: []\nledger: oops\n";
        assert!(matches!(MigrationConfig::from_yaml_str(yaml), Err(MigrateError::Yaml(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://localhost/app"),
            ("TESSERA_LEDGER_TABLE", "migration_log"),
            ("TESSERA_SIMULATE", "no"),
            ("USER", "dev"),
        ]
        .into_iter()
        .collect();

        let mut config = MigrationConfig::for_app(".", "web");
        config
            .apply_env_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/app"));
        assert_eq!(config.ledger_table, "migration_log");
        assert!(!config.simulate);
        assert_eq!(config.applied_by.as_deref(), Some("dev"));
    }

    #[test]
    fn test_invalid_simulate_flag() {
        let mut config = MigrationConfig::for_app(".", "web");
        let result = config.apply_env_from(|key| (key == "TESSERA_SIMULATE").then(|| "maybe".to_string()));
        assert!(matches!(result, Err(MigrateError::Configuration(_))));
    }

    #[test]
    fn test_validate_requires_explicit_simulation() {
        let config = MigrationConfig::for_app(".", "web");
        assert!(matches!(config.validate(), Err(MigrateError::Configuration(_))));

        let mut config = MigrationConfig::for_app(".", "web");
        config.simulate = true;
        assert!(config.validate().is_ok());

        let mut config = MigrationConfig::new(Vec::new());
        config.simulate = true;
        assert!(config.validate().is_err());

        let mut config = MigrationConfig::for_app(".", "web");
        config.simulate = true;
        config.ledger_table = "bad name".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_leaves_room_for_lock_table() {
        let mut config = MigrationConfig::for_app(".", "web");
        config.simulate = true;

        config.ledger_table = "m".repeat(58);
        assert!(config.validate().is_ok());

        config.ledger_table = "m".repeat(59);
        assert!(matches!(config.validate(), Err(MigrateError::Configuration(_))));

        config.ledger_table = format!("public.{}", "m".repeat(58));
        assert!(config.validate().is_ok());
    }
}
