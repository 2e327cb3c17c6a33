use anyhow::bail;
use tessera_migrate::{MigrationConfig, MigrationResult, MigrationStatus, Migrator};

pub async fn up(config: MigrationConfig) -> anyhow::Result<()> {
    let migrator = Migrator::connect(config).await?;
    let results = migrator.up().await?;

    if results.is_empty() {
        println!("✅ Database is up to date");
    }
    report(&migrator, &results)
}

pub async fn down(config: MigrationConfig, steps: usize) -> anyhow::Result<()> {
    if steps == 0 {
        bail!("--steps must be at least 1");
    }

    let migrator = Migrator::connect(config).await?;
    let results = migrator.down(steps).await?;

    if results.is_empty() {
        println!("Nothing to roll back");
    }
    report(&migrator, &results)
}

pub async fn status(config: MigrationConfig, json: bool) -> anyhow::Result<()> {
    let migrator = Migrator::connect(config).await?;
    let statuses = migrator.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    println!("Migration Status:");
    println!("================");
    if statuses.is_empty() {
        println!("No migrations found");
        return Ok(());
    }

    for status in &statuses {
        println!("{}", format_status(status));
    }

    let applied = statuses.iter().filter(|s| s.applied).count();
    println!("\n{} applied, {} pending", applied, statuses.len() - applied);
    if migrator.is_simulated() {
        println!("⚠️  Simulation mode: ledger state is not persisted");
    }
    Ok(())
}

pub fn create(config: MigrationConfig, name: &str, dry_run: bool) -> anyhow::Result<()> {
    let migrator = Migrator::offline(config);

    if dry_run {
        let scaffold = migrator.scaffold(name)?;
        println!("Would create: {}", scaffold.path.display());
        println!("{}", scaffold.template);
        return Ok(());
    }

    let scaffold = migrator.create(name)?;
    println!("Created migration: {}", scaffold.path.display());
    Ok(())
}

pub async fn ping(config: MigrationConfig) -> anyhow::Result<()> {
    let migrator = Migrator::connect(config).await?;
    let latency = migrator.ping().await?;

    let target = if migrator.is_simulated() { "simulated database" } else { "database" };
    println!("✅ Reached {} in {}ms", target, latency.as_millis());
    Ok(())
}

/// Print one line per result; error if any failed
fn report(migrator: &Migrator, results: &[MigrationResult]) -> anyhow::Result<()> {
    for result in results {
        println!("{}", format_result(result));
    }
    if migrator.is_simulated() && !results.is_empty() {
        println!("⚠️  Simulation mode: no SQL was executed");
    }

    match results.iter().find(|r| !r.success) {
        Some(failed) => bail!("migration {} failed", failed.version),
        None => Ok(()),
    }
}

fn format_result(result: &MigrationResult) -> String {
    let ms = result.duration.as_millis();
    match &result.error {
        None if result.success => format!("✅ {} {} ({}ms)", result.version, result.name, ms),
        error => format!(
            "❌ {} {} ({}ms): {}",
            result.version,
            result.name,
            ms,
            error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn format_status(status: &MigrationStatus) -> String {
    let mut line = match status.applied_at {
        Some(applied_at) if status.applied => format!(
            "  ✅ {}  {}  (applied {})",
            status.version,
            status.name,
            applied_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        _ => format!("  ⏳ {}  {}", status.version, status.name),
    };
    if status.drifted {
        line.push_str("  ⚠️ changed since applied");
    }
    line
}
