//! Migration Discovery - Scans configured directories for migration fragments
//!
//! Every configured [`MigrationSource`] is scanned independently. Missing
//! directories, non-matching filenames and unreadable files are skipped, so a
//! single bad location never aborts discovery.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::definitions::{MigrationFile, MigrationSource};

/// `YYYYMMDD_NNN_name.sql`; ASCII digits only
static MIGRATION_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]{8})_([0-9]{3})_(.+)\.sql$").expect("valid filename regex"));

/// Read access to the locations holding migration files
pub trait FileSystem: Send + Sync {
    /// Whether `path` exists and is a directory
    fn is_dir(&self, path: &Path) -> bool;

    /// Regular files directly under `dir`
    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// Read a file as UTF-8 text
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

/// [`FileSystem`] backed by `std::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }
}

/// Split a migration filename into `(version, name)`
///
/// ```
/// use tessera_migrate::discovery::parse_migration_filename;
///
/// assert_eq!(
///     parse_migration_filename("20240113_001_initial_schema.sql"),
///     Some(("20240113_001".to_string(), "initial_schema".to_string()))
/// );
/// assert_eq!(parse_migration_filename("2024_001_bad.sql"), None);
/// ```
pub fn parse_migration_filename(filename: &str) -> Option<(String, String)> {
    let captures = MIGRATION_FILENAME.captures(filename)?;
    let version = format!("{}_{}", &captures[1], &captures[2]);
    Some((version, captures[3].to_string()))
}

/// Scans migration sources and parses fragments
#[derive(Clone)]
pub struct Discoverer {
    fs: Arc<dyn FileSystem>,
}

impl Discoverer {
    /// Discoverer over the local filesystem
    pub fn new() -> Self {
        Self::with_filesystem(Arc::new(LocalFileSystem))
    }

    pub fn with_filesystem(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Discover fragments under every source, in source order
    pub fn discover(&self, sources: &[MigrationSource]) -> Vec<MigrationFile> {
        sources
            .iter()
            .flat_map(|source| self.discover_source(source))
            .collect()
    }

    /// Discover fragments under a single source
    pub fn discover_source(&self, source: &MigrationSource) -> Vec<MigrationFile> {
        if !self.fs.is_dir(&source.path) {
            tracing::debug!(path = %source.path.display(), "Migration directory not found, skipping");
            return Vec::new();
        }

        let mut paths = match self.fs.list_files(&source.path) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(
                    path = %source.path.display(),
                    error = %e,
                    "Failed to list migration directory, skipping"
                );
                return Vec::new();
            }
        };
        paths.sort();

        let mut files = Vec::new();
        for path in paths {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((version, name)) = parse_migration_filename(filename) else {
                tracing::trace!(file = filename, "Not a migration filename, skipping");
                continue;
            };

            let sql = match self.fs.read_to_string(&path) {
                Ok(sql) => sql,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read migration file, skipping"
                    );
                    continue;
                }
            };

            tracing::debug!(
                version = %version,
                name = %name,
                source = %source.kind,
                path = %path.display(),
                "Discovered migration fragment"
            );

            files.push(MigrationFile {
                version,
                name,
                source_kind: source.kind,
                priority: source.priority,
                sql,
                path,
            });
        }

        files
    }
}

impl Default for Discoverer {
    fn default() -> Self {
        Self::new()
    }
}
