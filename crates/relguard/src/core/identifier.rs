//! Identifier validation and quoting for dynamically built SQL.
//!
//! # Security
//!
//! SQL identifiers (table names, column names, schema names) cannot be passed as
//! parameters in prepared statements - only data values can be parameterized.
//! DDL statements cannot take parameters at all, so defaults, CHECK
//! expressions and type names written into DDL go through the validators here.
//!
//! To safely construct dynamic SQL with identifiers, we:
//! 1. Validate identifiers for suspicious patterns (null bytes, excessive length)
//! 2. Quote with double quotes
//! 3. Escape embedded double quotes

use crate::core::value::SqlValue;
use crate::error::{GuardError, Result};

/// Maximum identifier length. PostgreSQL truncates beyond 63 bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier for security issues.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes (injection vector)
/// - Identifiers exceeding maximum length
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GuardError::schema("Identifier cannot be empty"));
    }

    if name.contains('\0') {
        return Err(GuardError::schema(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(GuardError::schema(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// Escapes double quotes by doubling them and wraps in double quotes.
/// Validates the identifier before quoting.
///
/// ```
/// use relguard::core::identifier::quote_pg;
/// assert_eq!(quote_pg("users").unwrap(), "\"users\"");
/// assert_eq!(quote_pg("table\"name").unwrap(), "\"table\"\"name\"");
/// ```
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a PostgreSQL table name with schema.
///
/// Returns `schema.table` with proper quoting.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Render a value as a SQL literal for DDL, where parameters are not allowed.
pub fn quote_literal(value: &SqlValue) -> Result<String> {
    let text = match value.to_text() {
        None => return Ok("NULL".to_string()),
        Some(t) => t,
    };
    if text.contains('\0') {
        return Err(GuardError::Config(format!(
            "SECURITY: Literal contains null byte: {:?}",
            text
        )));
    }
    match value {
        SqlValue::Bool(_) | SqlValue::Int(_) | SqlValue::Float(_) | SqlValue::Decimal(_) => {
            Ok(text)
        }
        _ => Ok(format!("'{}'", text.replace('\'', "''"))),
    }
}

/// Validate free-form SQL text that ends up inside DDL: CHECK expressions,
/// USING cast expressions and DEFAULT expressions.
///
/// # Rejected Patterns
///
/// - Semicolons (multiple statement injection)
/// - SQL comments (`--`, `/*`, `*/`)
/// - Unbalanced parentheses
///
/// ```
/// use relguard::core::identifier::validate_check_constraint;
/// assert!(validate_check_constraint("deposit_amount >= 0").is_ok());
/// assert!(validate_check_constraint("1=1; DROP TABLE readers").is_err());
/// ```
pub fn validate_check_constraint(definition: &str) -> Result<()> {
    if definition.trim().is_empty() {
        return Err(GuardError::Config("Expression cannot be empty".into()));
    }

    if definition.contains(';') {
        return Err(GuardError::Config(format!(
            "SECURITY: Expression contains semicolon (possible injection): {:?}",
            definition
        )));
    }

    if definition.contains("--") || definition.contains("/*") || definition.contains("*/") {
        return Err(GuardError::Config(format!(
            "SECURITY: Expression contains SQL comment markers (possible injection): {:?}",
            definition
        )));
    }

    let mut depth = 0i32;
    let mut in_string = false;
    for ch in definition.chars() {
        match ch {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth -= 1;
                if depth < 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    if depth != 0 || in_string {
        return Err(GuardError::Config(format!(
            "Expression has unbalanced parentheses or quotes: {:?}",
            definition
        )));
    }

    Ok(())
}

/// Validate a type name used in DDL (`varchar(120)`, `numeric(10,2)`, `genre[]`).
pub fn validate_type_name(type_name: &str) -> Result<()> {
    let ok = !type_name.trim().is_empty()
        && type_name.chars().all(|c| {
            c.is_alphanumeric() || matches!(c, '_' | ' ' | '(' | ')' | ',' | '[' | ']' | '"' | '.')
        });
    if !ok {
        return Err(GuardError::Config(format!(
            "Invalid type name: {:?}",
            type_name
        )));
    }
    validate_check_constraint(type_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("books").is_ok());
        assert!(validate_identifier("loan_records").is_ok());
        assert!(validate_identifier("column with spaces").is_ok());
        assert!(validate_identifier("日本語").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        let result = validate_identifier("");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        assert!(validate_identifier("books\0; DROP").is_err());
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        let long = "a".repeat(64);
        assert!(validate_identifier(&long).is_err());
        assert!(validate_identifier(&"a".repeat(63)).is_ok());
    }

    // =========================================================================
    // Quoting tests
    // =========================================================================

    #[test]
    fn test_quote_pg() {
        assert_eq!(quote_pg("users").unwrap(), "\"users\"");
        assert_eq!(quote_pg("user\"table").unwrap(), "\"user\"\"table\"");
    }

    #[test]
    fn test_qualify_pg() {
        assert_eq!(
            qualify_pg("public", "books").unwrap(),
            "\"public\".\"books\""
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal(&SqlValue::Int(5)).unwrap(), "5");
        assert_eq!(quote_literal(&SqlValue::Null).unwrap(), "NULL");
        assert_eq!(
            quote_literal(&SqlValue::from("O'Brien")).unwrap(),
            "'O''Brien'"
        );
        assert_eq!(quote_literal(&SqlValue::Bool(true)).unwrap(), "true");
    }

    // =========================================================================
    // Expression tests
    // =========================================================================

    #[test]
    fn test_validate_check_constraint() {
        assert!(validate_check_constraint("price > 0").is_ok());
        assert!(validate_check_constraint("status IN ('a', 'b')").is_ok());
        assert!(validate_check_constraint("1=1; DROP TABLE x").is_err());
        assert!(validate_check_constraint("1=1 -- c").is_err());
        assert!(validate_check_constraint("(a > 0").is_err());
        assert!(validate_check_constraint("name <> ')'").is_ok());
        assert!(validate_check_constraint("   ").is_err());
    }

    #[test]
    fn test_validate_type_name() {
        assert!(validate_type_name("varchar(120)").is_ok());
        assert!(validate_type_name("numeric(10,2)").is_ok());
        assert!(validate_type_name("genre[]").is_ok());
        assert!(validate_type_name("timestamp with time zone").is_ok());
        assert!(validate_type_name("int; drop table x").is_err());
        assert!(validate_type_name("int'").is_err());
    }
}
