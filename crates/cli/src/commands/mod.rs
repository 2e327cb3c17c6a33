pub mod migrate;

use anyhow::{bail, Context};
use clap::Args;
use std::path::PathBuf;
use tessera_migrate::MigrationConfig;

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// YAML configuration file (takes precedence over --app/--root)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    pub database_url: Option<String>,

    /// Run without a database: nothing is executed and nothing persists
    #[arg(long, global = true)]
    pub simulate: bool,

    /// App whose migrations to manage (apps/<app>/migrations plus shared packages)
    #[arg(long, short, env = "TESSERA_APP", global = true)]
    pub app: Option<String>,

    /// Monorepo root
    #[arg(long, default_value = ".", global = true)]
    pub root: PathBuf,

    /// Debug-level logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Resolve configuration: file or app layout, then environment, then flags
pub fn resolve_config(args: &GlobalArgs) -> anyhow::Result<MigrationConfig> {
    resolve_config_with(args, |key| std::env::var(key).ok())
}

fn resolve_config_with<F>(args: &GlobalArgs, lookup: F) -> anyhow::Result<MigrationConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match (&args.config, &args.app) {
        (Some(path), _) => MigrationConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        (None, Some(app)) => MigrationConfig::for_app(&args.root, app),
        (None, None) => bail!("either --config or --app is required"),
    };

    config.apply_env_from(lookup)?;

    if let Some(url) = &args.database_url {
        config.database_url = Some(url.clone());
    }
    if args.simulate {
        config.simulate = true;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn args() -> GlobalArgs {
        GlobalArgs {
            config: None,
            database_url: None,
            simulate: false,
            app: None,
            root: PathBuf::from("/repo"),
            verbose: false,
            log_json: false,
        }
    }

    #[test]
    fn test_requires_config_or_app() {
        assert!(resolve_config_with(&args(), |_| None).is_err());
    }

    #[test]
    fn test_app_layout_with_flag_overrides() {
        let mut args = args();
        args.app = Some("web".to_string());
        args.database_url = Some("postgres://flag/db".to_string());

        let config = resolve_config_with(&args, |key| match key {
            "DATABASE_URL" => Some("postgres://env/db".to_string()),
            "TESSERA_SIMULATE" => Some("false".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.sources[0].path, PathBuf::from("/repo/apps/web/migrations"));
        assert_eq!(config.database_url.as_deref(), Some("postgres://flag/db"));
        assert!(!config.simulate);
    }

    #[test]
    fn test_config_file_with_simulate_flag() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tessera.yaml");
        fs::write(
            &path,
            "sources:\n  - path: db/app\n    kind: app\n    priority: 1\nledger_table: migration_log\n",
        )
        .unwrap();

        let mut args = args();
        args.config = Some(path);
        args.app = Some("ignored".to_string());
        args.simulate = true;

        let config = resolve_config_with(&args, |_| None).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].path, temp_dir.path().join("db/app"));
        assert_eq!(config.ledger_table, "migration_log");
        assert!(config.simulate);
        assert!(config.validate().is_ok());
    }
}
