//! Migration Combiner - Merges fragments into one migration per version
//!
//! Combination is a pure function of the discovered files: the same input
//! always yields byte-identical `combined_sql` in the same order. The ledger
//! identifies migrations by version, so any reordering here would silently
//! change what an already-applied version means.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::definitions::{CombinedMigration, MigrationFile};

/// `-- Up migration`, `-- down`, `-- migrate:up`, ... on a line of its own
static SECTION_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*--\s*(?:migrate:\s*)?(up|down)(?:\s+migration)?\s*:?\s*$")
        .expect("valid section marker regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Up,
    Down,
}

/// Up and down SQL of a single fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSections {
    pub up: String,
    pub down: Option<String>,
}

/// Split a fragment into its up and down sections
///
/// Without markers the whole text is the up section, unchanged.
pub fn split_sections(sql: &str) -> FragmentSections {
    if !sql.lines().any(|line| SECTION_MARKER.is_match(line)) {
        return FragmentSections {
            up: sql.to_string(),
            down: None,
        };
    }

    let mut up = Vec::new();
    let mut down = Vec::new();
    let mut current = Section::Up;

    for line in sql.lines() {
        if let Some(captures) = SECTION_MARKER.captures(line) {
            current = if captures[1].eq_ignore_ascii_case("down") {
                Section::Down
            } else {
                Section::Up
            };
            continue;
        }
        match current {
            Section::Up => up.push(line),
            Section::Down => down.push(line),
        }
    }

    let down = down.join("\n").trim().to_string();
    FragmentSections {
        up: up.join("\n").trim().to_string(),
        down: (!down.is_empty()).then_some(down),
    }
}

fn provenance_block(file: &MigrationFile, sql: &str) -> String {
    format!("-- From: {} ({})\n{}", file.source_kind, file.path.display(), sql)
}

/// Group fragments by version and concatenate them in priority order
///
/// Returns one [`CombinedMigration`] per distinct version, sorted by version.
pub fn combine(files: Vec<MigrationFile>) -> Vec<CombinedMigration> {
    let mut groups: BTreeMap<String, Vec<MigrationFile>> = BTreeMap::new();
    for file in files {
        groups.entry(file.version.clone()).or_default().push(file);
    }

    groups
        .into_iter()
        .map(|(version, mut sources)| {
            sources.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.path.to_string_lossy().cmp(&b.path.to_string_lossy()))
            });

            let sections: Vec<FragmentSections> =
                sources.iter().map(|file| split_sections(&file.sql)).collect();

            let combined_sql = sources
                .iter()
                .zip(&sections)
                .map(|(file, s)| provenance_block(file, &s.up))
                .collect::<Vec<_>>()
                .join("\n\n");

            let down_blocks: Vec<String> = sources
                .iter()
                .zip(&sections)
                .rev()
                .filter_map(|(file, s)| s.down.as_deref().map(|down| provenance_block(file, down)))
                .collect();

            let name = sources
                .iter()
                .map(|file| file.name.as_str())
                .collect::<Vec<_>>()
                .join(" + ");

            CombinedMigration {
                version,
                name,
                combined_sql,
                down_sql: (!down_blocks.is_empty()).then(|| down_blocks.join("\n\n")),
                sources,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::SourceKind;
    use std::path::PathBuf;

    fn fragment(version: &str, name: &str, kind: SourceKind, priority: i32, path: &str, sql: &str) -> MigrationFile {
        MigrationFile {
            version: version.to_string(),
            name: name.to_string(),
            source_kind: kind,
            priority,
            sql: sql.to_string(),
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn test_priority_ordering_and_name() {
        let files = vec![
            fragment("20240101_001", "users", SourceKind::Package, 2, "shared/20240101_001_users.sql", "GRANT SELECT ON users TO app;"),
            fragment("20240101_001", "users", SourceKind::App, 1, "app/20240101_001_users.sql", "CREATE TABLE users (id INT);"),
        ];

        let combined = combine(files);
        assert_eq!(combined.len(), 1);

        let migration = &combined[0];
        assert_eq!(migration.version, "20240101_001");
        assert_eq!(migration.name, "users + users");
        assert_eq!(
            migration.combined_sql,
            "-- From: app (app/20240101_001_users.sql)\nCREATE TABLE users (id INT);\n\n\
             -- From: package (shared/20240101_001_users.sql)\nGRANT SELECT ON users TO app;"
        );
        assert_eq!(migration.sources[0].source_kind, SourceKind::App);
        assert_eq!(migration.down_sql, None);
    }

    #[test]
    fn test_equal_priority_breaks_ties_by_path() {
        let files = vec![
            fragment("20240101_001", "b", SourceKind::Package, 2, "shared/b/20240101_001_b.sql", "B"),
            fragment("20240101_001", "a", SourceKind::Package, 2, "shared/a/20240101_001_a.sql", "A"),
        ];
        let combined = combine(files);
        assert_eq!(combined[0].name, "a + b");
        assert!(combined[0].combined_sql.find("\nA").unwrap() < combined[0].combined_sql.find("\nB").unwrap());
    }

    #[test]
    fn test_versions_sorted_ascending() {
        let files = vec![
            fragment("20240301_001", "c", SourceKind::App, 1, "app/c.sql", "C"),
            fragment("20240101_002", "b", SourceKind::App, 1, "app/b.sql", "B"),
            fragment("20240101_001", "a", SourceKind::App, 1, "app/a.sql", "A"),
        ];
        let versions: Vec<String> = combine(files).into_iter().map(|m| m.version).collect();
        assert_eq!(versions, vec!["20240101_001", "20240101_002", "20240301_001"]);
    }

    #[test]
    fn test_split_sections() {
        let plain = "CREATE TABLE t (id INT);\n-- update comment stays\n";
        assert_eq!(
            split_sections(plain),
            FragmentSections { up: plain.to_string(), down: None }
        );

        let sectioned = "-- Migration: posts\n\n-- Up migration\nCREATE TABLE posts (id INT);\n\n-- Down migration\nDROP TABLE posts;\n";
        let sections = split_sections(sectioned);
        assert_eq!(sections.up, "-- Migration: posts\n\nCREATE TABLE posts (id INT);");
        assert_eq!(sections.down.as_deref(), Some("DROP TABLE posts;"));

        let dbmate = "-- migrate:up\nSELECT 1;\n-- migrate:down\n";
        let sections = split_sections(dbmate);
        assert_eq!(sections.up, "SELECT 1;");
        assert_eq!(sections.down, None);
    }

    #[test]
    fn test_down_sql_in_reverse_priority_order() {
        let files = vec![
            fragment("20240101_001", "users", SourceKind::App, 1, "app/u.sql", "-- Up\nCREATE TABLE users (id INT);\n-- Down\nDROP TABLE users;"),
            fragment("20240101_001", "users", SourceKind::Package, 2, "shared/u.sql", "-- Up\nGRANT SELECT ON users TO app;\n-- Down\nREVOKE SELECT ON users FROM app;"),
        ];
        let combined = combine(files);
        let down = combined[0].down_sql.as_deref().unwrap();
        assert!(down.find("REVOKE").unwrap() < down.find("DROP TABLE").unwrap());
        assert!(!combined[0].combined_sql.contains("DROP TABLE"));
        assert!(!combined[0].combined_sql.contains("REVOKE"));
    }
}
