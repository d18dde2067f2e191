//! SQL text for guarded DML.
//!
//! Identifiers come from the catalog and are always quoted. Values are
//! always bound: each placeholder declares the parameter type matching the
//! value's wire encoding (`$1::int8`) and is cast to the column's declared
//! type, so enum, varchar and numeric columns accept the same encodings.
//!
//! Values written to a column are cast to the full declared type. Values a
//! column is compared against are cast to the type without its modifiers:
//! an explicit cast to `varchar(20)` truncates and one to `numeric(8,2)`
//! rounds, which would let a condition match rows it does not equal.

use crate::core::identifier::quote_pg;
use crate::core::schema::ColumnDescriptor;
use crate::core::value::SqlValue;
use crate::error::Result;

/// Positional parameters of one statement.
#[derive(Debug, Default)]
pub struct ParamList {
    values: Vec<SqlValue>,
}

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value`, returning its typed placeholder.
    pub fn bind(&mut self, value: SqlValue) -> String {
        let placeholder = format!("${}::{}", self.values.len() + 1, value.param_type());
        self.values.push(value);
        placeholder
    }

    /// Bind `value` and cast it to the column's declared type.
    pub fn bind_for(&mut self, value: SqlValue, column: &ColumnDescriptor) -> String {
        format!("CAST({} AS {})", self.bind(value), column.sql_type)
    }

    /// Bind `value` for comparison with `column`.
    pub fn bind_match(&mut self, value: SqlValue, column: &ColumnDescriptor) -> String {
        format!("CAST({} AS {})", self.bind(value), comparison_type(&column.sql_type))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

/// Declared type with length, precision and scale modifiers removed.
///
/// `character(n)` becomes `bpchar` and `bit(n)` becomes `bit varying`,
/// since their bare names mean a length of one.
pub fn comparison_type(sql_type: &str) -> String {
    let mut stripped = String::with_capacity(sql_type.len());
    let mut depth = 0usize;
    let mut quoted = false;
    for ch in sql_type.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                stripped.push(ch);
            }
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(ch),
            _ => {}
        }
    }
    let stripped = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let (base, dims) = match stripped.find("[]") {
        Some(at) => stripped.split_at(at),
        None => (stripped.as_str(), ""),
    };
    let base = match base.trim_end() {
        "character" => "bpchar",
        "bit" => "bit varying",
        other => other,
    };
    format!("{}{}", base, dims)
}

/// Quoted column reference, optionally qualified by table name.
pub fn column_ref(qualifier: Option<&str>, column: &str) -> Result<String> {
    let quoted = quote_pg(column)?;
    Ok(match qualifier {
        Some(table) => format!("{}.{}", quote_pg(table)?, quoted),
        None => quoted,
    })
}

/// Select-list expression for a column.
///
/// Enum and unrecognized types are read as text so every reflected column
/// decodes; the output name is `alias` or the bare column name.
pub fn projection(
    qualifier: Option<&str>,
    column: &ColumnDescriptor,
    alias: Option<&str>,
) -> Result<String> {
    let reference = column_ref(qualifier, &column.name)?;
    let expr = match column.kind.reads_as_text() {
        Some(cast) => format!("{}::{}", reference, cast),
        None => reference,
    };
    let needs_alias = alias.is_some() || column.kind.reads_as_text().is_some();
    Ok(if needs_alias {
        format!("{} AS {}", expr, quote_pg(alias.unwrap_or(&column.name))?)
    } else {
        expr
    })
}

/// `column = value`, or `column IS NULL` for a NULL value.
pub fn equality(
    qualifier: Option<&str>,
    column: &ColumnDescriptor,
    value: SqlValue,
    params: &mut ParamList,
) -> Result<String> {
    let reference = column_ref(qualifier, &column.name)?;
    Ok(if value.is_null() {
        format!("{} IS NULL", reference)
    } else {
        format!("{} = {}", reference, params.bind_match(value, column))
    })
}

/// ` ORDER BY a ASC, b DESC` (empty when there is nothing to order by).
pub fn order_clause(terms: &[(String, bool)]) -> String {
    if terms.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = terms
        .iter()
        .map(|(expr, ascending)| format!("{} {}", expr, if *ascending { "ASC" } else { "DESC" }))
        .collect();
    format!(" ORDER BY {}", parts.join(", "))
}

/// ` WHERE p1 AND p2` (empty for no predicates).
pub fn where_clause(predicates: &[String]) -> String {
    if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::library_snapshot;

    #[test]
    fn test_placeholders_are_numbered_and_typed() {
        let mut params = ParamList::new();
        assert_eq!(params.bind(SqlValue::Int(3)), "$1::int8");
        assert_eq!(params.bind(SqlValue::from("x")), "$2::text");
        assert_eq!(params.len(), 2);
        assert_eq!(params.into_values()[0], SqlValue::Int(3));
    }

    #[test]
    fn test_enum_column_cast_and_projection() {
        let snapshot = library_snapshot();
        let genre = snapshot.table("books").unwrap().column("genre").unwrap().clone();

        let mut params = ParamList::new();
        assert_eq!(
            params.bind_for(SqlValue::from("poetry"), &genre),
            "CAST($1::text AS genre)"
        );
        assert_eq!(
            projection(None, &genre, None).unwrap(),
            "\"genre\"::text AS \"genre\""
        );
        assert_eq!(
            projection(Some("books"), &genre, Some("books.genre")).unwrap(),
            "\"books\".\"genre\"::text AS \"books.genre\""
        );
    }

    #[test]
    fn test_comparison_type_drops_modifiers() {
        assert_eq!(comparison_type("character varying(20)"), "character varying");
        assert_eq!(comparison_type("numeric(8,2)"), "numeric");
        assert_eq!(comparison_type("character(3)"), "bpchar");
        assert_eq!(comparison_type("character varying(20)[]"), "character varying[]");
        assert_eq!(
            comparison_type("timestamp(3) without time zone"),
            "timestamp without time zone"
        );
        assert_eq!(comparison_type("bit(8)"), "bit varying");
        assert_eq!(comparison_type("integer"), "integer");
        assert_eq!(comparison_type("\"Odd(type)\""), "\"Odd(type)\"");
    }

    #[test]
    fn test_condition_values_are_not_truncated_or_rounded() {
        let snapshot = library_snapshot();
        let books = snapshot.table("books").unwrap();
        let mut params = ParamList::new();

        let isbn = books.column("isbn").unwrap();
        assert_eq!(
            equality(None, isbn, SqlValue::from("ABCDEFGHIJKLMNOPQRSTUVWXYZ"), &mut params).unwrap(),
            "\"isbn\" = CAST($1::text AS character varying)"
        );
        let price = books.column("price").unwrap();
        assert_eq!(
            equality(None, price, SqlValue::Float(12.499), &mut params).unwrap(),
            "\"price\" = CAST($2::float8 AS numeric)"
        );
        // Written values keep the declared type.
        assert_eq!(
            params.bind_for(SqlValue::from("x"), isbn),
            "CAST($3::text AS character varying(20))"
        );
    }

    #[test]
    fn test_equality_uses_is_null() {
        let snapshot = library_snapshot();
        let column = snapshot.table("loan_records").unwrap().column("actual_return_date").unwrap().clone();
        let mut params = ParamList::new();
        assert_eq!(
            equality(None, &column, SqlValue::Null, &mut params).unwrap(),
            "\"actual_return_date\" IS NULL"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_clauses() {
        assert_eq!(order_clause(&[]), "");
        assert_eq!(
            order_clause(&[("\"title\"".into(), true), ("\"price\"".into(), false)]),
            " ORDER BY \"title\" ASC, \"price\" DESC"
        );
        assert_eq!(where_clause(&[]), "");
        assert_eq!(where_clause(&["a".into(), "b".into()]), " WHERE a AND b");
    }
}
