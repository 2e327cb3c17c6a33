//! Migration Definitions - Core types shared by the engine
//!
//! A [`MigrationFile`] is one discovered fragment, a [`CombinedMigration`] is
//! the unit of application for a version, and an [`AppliedMigration`] is a
//! ledger row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where a migration fragment originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// App-specific migrations directory
    App,
    /// Shared package migrations (common or app-scoped)
    Package,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::App => write!(f, "app"),
            SourceKind::Package => write!(f, "package"),
        }
    }
}

/// A configured discovery root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSource {
    /// Directory scanned for `YYYYMMDD_NNN_name.sql` files
    pub path: PathBuf,
    /// Origin of the fragments found under `path`
    pub kind: SourceKind,
    /// Lower values are concatenated first
    pub priority: i32,
}

impl MigrationSource {
    pub fn new(path: impl Into<PathBuf>, kind: SourceKind, priority: i32) -> Self {
        Self {
            path: path.into(),
            kind,
            priority,
        }
    }
}

/// One parsed migration fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFile {
    /// `YYYYMMDD_NNN`
    pub version: String,
    /// Slug after the version in the filename
    pub name: String,
    pub source_kind: SourceKind,
    pub priority: i32,
    /// Raw file contents
    pub sql: String,
    pub path: PathBuf,
}

/// All fragments for one version, merged into a single executable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CombinedMigration {
    pub version: String,
    /// Fragment names joined with `" + "`
    pub name: String,
    /// Up SQL of every fragment in priority order, with provenance comments
    pub combined_sql: String,
    /// Down SQL of every fragment in reverse priority order, if any fragment has one
    pub down_sql: Option<String>,
    /// Fragments ordered by `(priority, path)`
    pub sources: Vec<MigrationFile>,
}

impl CombinedMigration {
    /// Hex SHA-256 over each fragment's kind, file name and raw contents
    ///
    /// Directories are left out so the same files reached through a
    /// differently spelled root hash the same.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for source in &self.sources {
            let file_name = source
                .path
                .file_name()
                .map(|name| name.to_string_lossy())
                .unwrap_or_default();
            hasher.update(source.source_kind.to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(file_name.as_bytes());
            hasher.update([0u8]);
            hasher.update(source.sql.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Ledger row for an applied version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub version: String,
    pub description: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub applied_by: Option<String>,
    pub checksum: Option<String>,
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Apply the migration (run UP statements)
    Up,
    /// Rollback the migration (run DOWN statements)
    Down,
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationResult {
    pub version: String,
    pub name: String,
    pub direction: MigrationDirection,
    pub success: bool,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MigrationResult {
    pub(crate) fn succeeded(
        migration: &CombinedMigration,
        direction: MigrationDirection,
        duration: Duration,
    ) -> Self {
        Self {
            version: migration.version.clone(),
            name: migration.name.clone(),
            direction,
            success: true,
            duration,
            error: None,
        }
    }

    pub(crate) fn failed(
        version: impl Into<String>,
        name: impl Into<String>,
        direction: MigrationDirection,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            direction,
            success: false,
            duration,
            error: Some(error.into()),
        }
    }
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}

/// Merged discovered/applied view used for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: String,
    pub name: String,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    /// Applied SQL no longer matches what is on disk
    pub drifted: bool,
}

/// A freshly generated migration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationScaffold {
    pub version: String,
    pub filename: String,
    pub path: PathBuf,
    pub template: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combined(dir: &str, sql: &str) -> CombinedMigration {
        CombinedMigration {
            version: "20240101_001".to_string(),
            name: "users".to_string(),
            combined_sql: format!("-- From: app ({}/20240101_001_users.sql)\n{}", dir, sql),
            down_sql: None,
            sources: vec![MigrationFile {
                version: "20240101_001".to_string(),
                name: "users".to_string(),
                source_kind: SourceKind::App,
                priority: 1,
                sql: sql.to_string(),
                path: PathBuf::from(dir).join("20240101_001_users.sql"),
            }],
        }
    }

    #[test]
    fn test_checksum_ignores_directory_spelling() {
        let absolute = combined("/repo/apps/web/migrations", "CREATE TABLE users ();");
        let relative = combined("./apps/web/migrations", "CREATE TABLE users ();");

        assert_eq!(absolute.checksum().len(), 64);
        assert_eq!(absolute.checksum(), relative.checksum());
    }

    #[test]
    fn test_checksum_tracks_content() {
        let before = combined("/repo", "CREATE TABLE users ();");
        let after = combined("/repo", "CREATE TABLE users (id INT);");
        assert_ne!(before.checksum(), after.checksum());
    }

    #[test]
    fn test_source_kind_display() {
        assert_eq!(SourceKind::App.to_string(), "app");
        assert_eq!(SourceKind::Package.to_string(), "package");
    }
}
