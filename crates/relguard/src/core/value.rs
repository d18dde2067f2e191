//! SQL value types for row maps, bound parameters and query results.
//!
//! [`SqlValue`] is the single value representation that flows between callers
//! and the store. Rows supplied by callers are [`RowMap`]s; rows read back are
//! [`Record`]s that keep the column order of the statement.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use bytes::BytesMut;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use uuid::Uuid;

/// Column name → value map supplied by callers for inserts, updates and conditions.
pub type RowMap = BTreeMap<String, SqlValue>;

/// An owned SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Any integer width (smallint, integer, bigint).
    Int(i64),
    /// Floating point (real, double precision).
    Float(f64),
    /// Exact numeric.
    Decimal(Decimal),
    /// Text, varchar, enum labels.
    Text(String),
    /// Date without time component.
    Date(NaiveDate),
    /// Timestamp (timezone-aware values are normalized to UTC).
    DateTime(NaiveDateTime),
    /// UUID value.
    Uuid(Uuid),
    /// One-dimensional array.
    Array(Vec<SqlValue>),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// PostgreSQL type the bound parameter is declared as.
    ///
    /// Placeholders are written as `$n::<type>` so the server never has to
    /// infer a parameter type that disagrees with the encoding used by
    /// [`ToSql`].
    pub fn param_type(&self) -> &'static str {
        match self {
            SqlValue::Null | SqlValue::Text(_) => "text",
            SqlValue::Bool(_) => "bool",
            SqlValue::Int(_) => "int8",
            SqlValue::Float(_) => "float8",
            SqlValue::Decimal(_) => "numeric",
            SqlValue::Date(_) => "date",
            SqlValue::DateTime(_) => "timestamp",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::Array(_) => "text[]",
        }
    }

    /// Short name of the value's type, used in violation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "boolean",
            SqlValue::Int(_) => "integer",
            SqlValue::Float(_) => "float",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::Text(_) => "string",
            SqlValue::Date(_) => "date",
            SqlValue::DateTime(_) => "timestamp",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::Array(_) => "array",
        }
    }

    /// Numeric view of the value, for range checks.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Float(v) => Some(*v),
            SqlValue::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Integer view of the value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            _ => None,
        }
    }

    /// Borrow the text of a `Text` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text rendering as PostgreSQL would accept it on input. `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(v) => Some(v.to_string()),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Decimal(v) => Some(v.to_string()),
            SqlValue::Text(v) => Some(v.clone()),
            SqlValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            SqlValue::DateTime(v) => Some(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            SqlValue::Uuid(v) => Some(v.to_string()),
            SqlValue::Array(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| match item.to_text() {
                        None => "NULL".to_string(),
                        Some(t) => format!("\"{}\"", t.replace('\\', "\\\\").replace('"', "\\\"")),
                    })
                    .collect();
                Some(format!("{{{}}}", parts.join(",")))
            }
        }
    }

    /// Convert a JSON value (as supplied by a form layer or the CLI).
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => SqlValue::Text(s),
            serde_json::Value::Array(items) => {
                SqlValue::Array(items.into_iter().map(SqlValue::from_json).collect())
            }
            other => SqlValue::Text(other.to_string()),
        }
    }

    /// Convert to JSON for output.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Bool(b) => serde_json::Value::Bool(*b),
            SqlValue::Int(i) => serde_json::Value::from(*i),
            SqlValue::Float(f) => serde_json::Value::from(*f),
            SqlValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(SqlValue::to_json).collect())
            }
            other => other
                .to_text()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Text(s) => write!(f, "'{}'", s),
            other => f.write_str(&other.to_text().unwrap_or_default()),
        }
    }
}

// Serialized through JSON so callers can pass defaults and rows as plain JSON/YAML.
impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(SqlValue::from_json)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::Int(v) => v.to_sql(ty, out),
            SqlValue::Float(v) => v.to_sql(ty, out),
            SqlValue::Decimal(v) => v.to_sql(ty, out),
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Date(v) => v.to_sql(ty, out),
            SqlValue::DateTime(v) => v.to_sql(ty, out),
            SqlValue::Uuid(v) => v.to_sql(ty, out),
            SqlValue::Array(items) => {
                let texts: Vec<Option<String>> = items.iter().map(SqlValue::to_text).collect();
                texts.to_sql(ty, out)
            }
        }
    }

    // The declared parameter type always comes from `param_type`.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// One result row, keeping the column order of the statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl Record {
    /// Build a record from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        K: Into<String>,
    {
        let (columns, values) = pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self { columns, values }
    }

    /// Value of a column by name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_str)
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        match self.get(column) {
            Some(SqlValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Text array column, NULL elements dropped.
    pub fn get_text_array(&self, column: &str) -> Vec<String> {
        match self.get(column) {
            Some(SqlValue::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Convert into a column → value map.
    pub fn into_map(self) -> RowMap {
        self.columns.into_iter().zip(self.values).collect()
    }

    /// JSON object for output.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// Build a [`RowMap`] from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> RowMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<SqlValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
