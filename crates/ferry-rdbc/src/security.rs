//! Input hardening for SQL text and connection URLs.
//!
//! Two kinds of untrusted text end up inside strings we hand to a server:
//! identifiers (schema and table names from configuration) and connection
//! URL components (host, database). Both are checked here. Credentials and
//! the driver qualifier are never checked, they are percent-encoded by the
//! URL builder instead.

use crate::error::Error;

/// Longest identifier SQL Server accepts (`sysname`)
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Validate a SQL identifier (schema or table name).
///
/// - Must not be empty
/// - At most [`MAX_IDENTIFIER_LEN`] characters
/// - Must start with an ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use ferry_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("tb_keyValueData").is_ok());
/// assert!(validate_sql_identifier("_staging").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("1abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max {MAX_IDENTIFIER_LEN})",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Escape a string value for a single-quoted SQL literal.
///
/// Only used for catalog lookups where the statement text is built in full.
///
/// ```
/// use ferry_rdbc::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("chest"), "chest");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

/// Validate a non-credential connection URL component.
///
/// Rejects characters that would change how the URL is split into
/// authority, path and query: `/ @ ? # :` as well as whitespace and
/// control characters. `field` names the component in the error message.
///
/// ```
/// use ferry_rdbc::security::validate_url_component;
///
/// assert!(validate_url_component("host", "mssql.server.url").is_ok());
/// assert!(validate_url_component("database", "dbName").is_ok());
/// assert!(validate_url_component("host", "evil@host").is_err());
/// ```
pub fn validate_url_component(field: &str, value: &str) -> crate::Result<()> {
    if value.is_empty() {
        return Err(Error::config(format!("{field} cannot be empty")));
    }

    if let Some(c) = value
        .chars()
        .find(|c| matches!(c, '/' | '@' | '?' | '#' | ':') || c.is_whitespace() || c.is_control())
    {
        return Err(Error::config(format!(
            "{field} '{value}' contains invalid character {c:?}"
        )));
    }

    Ok(())
}
