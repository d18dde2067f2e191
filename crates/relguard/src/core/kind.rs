//! Semantic column kinds.
//!
//! Every reflected column is classified exactly once, when the catalog
//! snapshot is built. Validation and query building match on [`ColumnKind`]
//! exhaustively instead of re-inspecting type names.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::value::SqlValue;

/// Semantic kind of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    String,
    Integer,
    Numeric,
    Boolean,
    Date,
    Timestamp,
    Uuid,
    /// User-defined enum with its labels in declaration order.
    Enum {
        type_name: String,
        values: Vec<String>,
    },
    Array {
        element: Box<ColumnKind>,
    },
    /// Any type without a dedicated kind (json, bytea, ranges, ...).
    Other {
        type_name: String,
    },
}

impl ColumnKind {
    /// Classify a PostgreSQL `udt_name`.
    ///
    /// Array types are reported by PostgreSQL as the element name prefixed
    /// with an underscore (`_int4`, `_genre`). `enum_values` resolves a
    /// user-defined type name to its labels when that type is an enum.
    pub fn classify<F>(udt_name: &str, enum_values: F) -> Self
    where
        F: Fn(&str) -> Option<Vec<String>>,
    {
        if let Some(element) = udt_name.strip_prefix('_') {
            return ColumnKind::Array {
                element: Box::new(Self::classify(element, enum_values)),
            };
        }

        match udt_name {
            "text" | "varchar" | "bpchar" | "char" | "name" | "citext" => ColumnKind::String,
            "int2" | "int4" | "int8" => ColumnKind::Integer,
            "numeric" | "float4" | "float8" | "money" => ColumnKind::Numeric,
            "bool" => ColumnKind::Boolean,
            "date" => ColumnKind::Date,
            "timestamp" | "timestamptz" => ColumnKind::Timestamp,
            "uuid" => ColumnKind::Uuid,
            other => match enum_values(other) {
                Some(values) => ColumnKind::Enum {
                    type_name: other.to_string(),
                    values,
                },
                None => ColumnKind::Other {
                    type_name: other.to_string(),
                },
            },
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, ColumnKind::Integer)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Integer | ColumnKind::Numeric)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ColumnKind::String)
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, ColumnKind::Boolean)
    }

    /// Allowed labels for enum columns.
    pub fn enum_values(&self) -> Option<&[String]> {
        match self {
            ColumnKind::Enum { values, .. } => Some(values),
            _ => None,
        }
    }

    /// Whether values of this kind must be read back as text.
    ///
    /// The driver has no native decoding for enum or arbitrary user types,
    /// so the query builder projects those columns through `::text`.
    pub fn reads_as_text(&self) -> Option<&'static str> {
        match self {
            ColumnKind::Enum { .. } | ColumnKind::Other { .. } => Some("text"),
            ColumnKind::Array { element } => match element.reads_as_text() {
                Some(_) => Some("text[]"),
                None => None,
            },
            _ => None,
        }
    }

    /// Whether a non-NULL value is compatible with this kind.
    ///
    /// Strings are accepted for date, timestamp and uuid columns when they
    /// parse, since form layers submit those as text. A string is never
    /// accepted where a number or boolean is declared.
    pub fn accepts(&self, value: &SqlValue) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            ColumnKind::String => matches!(value, SqlValue::Text(_)),
            ColumnKind::Integer => value.as_i64().is_some(),
            ColumnKind::Numeric => value.as_f64().is_some(),
            ColumnKind::Boolean => matches!(value, SqlValue::Bool(_)),
            ColumnKind::Date => match value {
                SqlValue::Date(_) => true,
                SqlValue::Text(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
                _ => false,
            },
            ColumnKind::Timestamp => match value {
                SqlValue::DateTime(_) | SqlValue::Date(_) => true,
                SqlValue::Text(s) => parses_as_timestamp(s),
                _ => false,
            },
            ColumnKind::Uuid => match value {
                SqlValue::Uuid(_) => true,
                SqlValue::Text(s) => uuid::Uuid::parse_str(s).is_ok(),
                _ => false,
            },
            ColumnKind::Enum { .. } => matches!(value, SqlValue::Text(_)),
            ColumnKind::Array { element } => match value {
                SqlValue::Array(items) => items.iter().all(|item| element.accepts(item)),
                _ => false,
            },
            ColumnKind::Other { .. } => true,
        }
    }
}

fn parses_as_timestamp(s: &str) -> bool {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];
    FORMATS
        .iter()
        .any(|f| NaiveDateTime::parse_from_str(s, f).is_ok())
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || chrono::DateTime::parse_from_rfc3339(s).is_ok()
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::String => f.write_str("string"),
            ColumnKind::Integer => f.write_str("integer"),
            ColumnKind::Numeric => f.write_str("numeric"),
            ColumnKind::Boolean => f.write_str("boolean"),
            ColumnKind::Date => f.write_str("date"),
            ColumnKind::Timestamp => f.write_str("timestamp"),
            ColumnKind::Uuid => f.write_str("uuid"),
            ColumnKind::Enum { type_name, .. } => write!(f, "enum {}", type_name),
            ColumnKind::Array { element } => write!(f, "{}[]", element),
            ColumnKind::Other { type_name } => f.write_str(type_name),
        }
    }
}
