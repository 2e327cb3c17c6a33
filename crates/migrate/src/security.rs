//! Identifier validation for the ledger table name
//!
//! The ledger table name comes from configuration and is interpolated into
//! DDL/DML, so it is validated and quoted before use. Everything else the
//! ledger sends goes through bound parameters.

use crate::error::{MigrateError, MigrateResult};

/// Characters allowed in SQL identifiers (alphanumeric, underscore, dollar)
const ALLOWED_IDENTIFIER_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_$";

/// SQL keywords rejected as bare table names
static SQL_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "FROM", "WHERE", "JOIN", "UNION", "DROP", "CREATE",
    "ALTER", "GRANT", "REVOKE", "TRUNCATE", "TABLE", "USER", "CURRENT_USER", "SESSION_USER",
];

/// Postgres truncates identifiers at 63 bytes
const MAX_IDENTIFIER_LEN: usize = 63;

/// Escape a single identifier part by doubling quotes and wrapping it
///
/// ```
/// use tessera_migrate::security::escape_identifier;
///
/// assert_eq!(escape_identifier("schema_migrations"), "\"schema_migrations\"");
/// assert_eq!(escape_identifier("odd\"name"), "\"odd\"\"name\"");
/// ```
pub fn escape_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Validate one identifier part (no dots)
pub fn validate_identifier(identifier: &str) -> MigrateResult<()> {
    let Some(first) = identifier.chars().next() else {
        return Err(MigrateError::Validation(
            "Identifier cannot be empty".to_string(),
        ));
    };

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(MigrateError::Validation(format!(
            "Identifier '{}' is too long (max {} characters)",
            identifier, MAX_IDENTIFIER_LEN
        )));
    }

    if let Some(c) = identifier
        .chars()
        .find(|c| !ALLOWED_IDENTIFIER_CHARS.contains(*c))
    {
        return Err(MigrateError::Validation(format!(
            "Identifier '{}' contains invalid character '{}'",
            identifier, c
        )));
    }

    if first.is_ascii_digit() {
        return Err(MigrateError::Validation(format!(
            "Identifier '{}' cannot start with a number",
            identifier
        )));
    }

    if SQL_KEYWORDS.contains(&identifier.to_uppercase().as_str()) {
        return Err(MigrateError::Validation(format!(
            "Identifier '{}' is a reserved SQL keyword",
            identifier
        )));
    }

    Ok(())
}

/// Validate a possibly schema-qualified table name (`table` or `schema.table`)
pub fn validate_table_name(name: &str) -> MigrateResult<()> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(MigrateError::Validation(format!(
            "Table name '{}' may have at most one schema qualifier",
            name
        )));
    }
    parts.into_iter().try_for_each(validate_identifier)
}

/// Quote a validated, possibly schema-qualified table name
pub fn quote_table_name(name: &str) -> MigrateResult<String> {
    validate_table_name(name)?;
    Ok(name
        .split('.')
        .map(escape_identifier)
        .collect::<Vec<_>>()
        .join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("schema_migrations").is_ok());
        assert!(validate_identifier("_ledger$1").is_ok());

        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1ledger").is_err());
        assert!(validate_identifier("ledger; DROP TABLE users").is_err());
        assert!(validate_identifier("select").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_schema_qualified_names() {
        assert!(validate_table_name("public.schema_migrations").is_ok());
        assert!(validate_table_name("a.b.c").is_err());
        assert!(validate_table_name("public.").is_err());

        assert_eq!(
            quote_table_name("public.schema_migrations").unwrap(),
            "\"public\".\"schema_migrations\""
        );
    }
}
