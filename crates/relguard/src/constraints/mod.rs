//! Structured rules derived from CHECK constraint text.
//!
//! The server stores CHECK constraints as expressions; the catalog only sees
//! them as printed by `pg_get_constraintdef`. The [`interpreter`] recognizes
//! a handful of common shapes and turns them into [`ConstraintRule`]s that
//! the validator can evaluate before a statement is sent. Anything it does
//! not recognize is left to the server.

pub mod interpreter;

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::core::value::SqlValue;

pub use interpreter::{interpret_check, interpret_table, mentions_column};

/// Comparison operator of a cross-field or range rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            "=" => Some(CompareOp::Eq),
            "<>" | "!=" => Some(CompareOp::Ne),
            _ => None,
        }
    }

    /// The operator with its operands swapped (`a < b` ⇔ `b > a`).
    pub fn flip(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
        }
    }

    /// Evaluate `left OP right`. `None` when either side is NULL or the
    /// values are not comparable, which a CHECK constraint treats as passing.
    pub fn holds(self, left: &SqlValue, right: &SqlValue) -> Option<bool> {
        let ordering = compare_values(left, right)?;
        Some(match self {
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Numeric bound of a range rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub value: f64,
    pub inclusive: bool,
}

impl Bound {
    pub fn inclusive(value: f64) -> Self {
        Self {
            value,
            inclusive: true,
        }
    }

    pub fn exclusive(value: f64) -> Self {
        Self {
            value,
            inclusive: false,
        }
    }
}

/// A rule interpreted from one CHECK constraint.
///
/// Every variant names the constraint it was derived from and the column
/// that owns it; `other`/`columns` always name columns of the same table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ConstraintRule {
    Range {
        constraint: String,
        column: String,
        min: Option<Bound>,
        max: Option<Bound>,
    },
    Membership {
        constraint: String,
        column: String,
        values: Vec<String>,
    },
    CrossFieldCompare {
        constraint: String,
        column: String,
        op: CompareOp,
        other: String,
        null_guarded: bool,
    },
    EqualOrBothNull {
        constraint: String,
        column: String,
        other: String,
    },
    NullConsistency {
        constraint: String,
        columns: Vec<String>,
    },
}

impl ConstraintRule {
    /// Name of the CHECK constraint the rule came from.
    pub fn constraint(&self) -> &str {
        match self {
            ConstraintRule::Range { constraint, .. }
            | ConstraintRule::Membership { constraint, .. }
            | ConstraintRule::CrossFieldCompare { constraint, .. }
            | ConstraintRule::EqualOrBothNull { constraint, .. }
            | ConstraintRule::NullConsistency { constraint, .. } => constraint,
        }
    }

    /// Column the rule is reported against.
    pub fn column(&self) -> &str {
        match self {
            ConstraintRule::Range { column, .. }
            | ConstraintRule::Membership { column, .. }
            | ConstraintRule::CrossFieldCompare { column, .. }
            | ConstraintRule::EqualOrBothNull { column, .. } => column,
            ConstraintRule::NullConsistency { columns, .. } => {
                columns.first().map(String::as_str).unwrap_or_default()
            }
        }
    }

    /// Every column the rule reads.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            ConstraintRule::Range { column, .. } | ConstraintRule::Membership { column, .. } => {
                vec![column]
            }
            ConstraintRule::CrossFieldCompare { column, other, .. }
            | ConstraintRule::EqualOrBothNull { column, other, .. } => vec![column, other],
            ConstraintRule::NullConsistency { columns, .. } => {
                columns.iter().map(String::as_str).collect()
            }
        }
    }
}

impl fmt::Display for ConstraintRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintRule::Range {
                column, min, max, ..
            } => {
                write!(f, "{}", column)?;
                if let Some(b) = min {
                    write!(f, " {} {}", if b.inclusive { ">=" } else { ">" }, b.value)?;
                }
                if let Some(b) = max {
                    if min.is_some() {
                        f.write_str(" and")?;
                    }
                    write!(f, " {} {}", if b.inclusive { "<=" } else { "<" }, b.value)?;
                }
                Ok(())
            }
            ConstraintRule::Membership { column, values, .. } => {
                write!(f, "{} in ({})", column, values.join(", "))
            }
            ConstraintRule::CrossFieldCompare {
                column,
                op,
                other,
                null_guarded,
                ..
            } => {
                if *null_guarded {
                    write!(f, "{} is null or {} {} {}", column, column, op, other)
                } else {
                    write!(f, "{} {} {}", column, op, other)
                }
            }
            ConstraintRule::EqualOrBothNull { column, other, .. } => {
                write!(f, "{} = {} or both null", column, other)
            }
            ConstraintRule::NullConsistency { columns, .. } => {
                write!(f, "{} all null or all set", columns.join(", "))
            }
        }
    }
}

/// Order two values the way the server would compare them.
///
/// Numbers compare numerically across integer/float/decimal, temporal
/// values compare as timestamps (dates and parseable text included), and
/// text compares lexically. Anything else is incomparable.
pub fn compare_values(left: &SqlValue, right: &SqlValue) -> Option<Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (as_timestamp(left), as_timestamp(right)) {
        return Some(a.cmp(&b));
    }
    match (left, right) {
        (SqlValue::Text(a), SqlValue::Text(b)) => Some(a.cmp(b)),
        (SqlValue::Bool(a), SqlValue::Bool(b)) => Some(a.cmp(b)),
        (SqlValue::Uuid(a), SqlValue::Uuid(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn as_timestamp(value: &SqlValue) -> Option<NaiveDateTime> {
    match value {
        SqlValue::DateTime(dt) => Some(*dt),
        SqlValue::Date(d) => d.and_hms_opt(0, 0, 0),
        SqlValue::Text(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_compare_across_numeric_types() {
        assert_eq!(
            compare_values(&SqlValue::Int(2), &SqlValue::Decimal(Decimal::new(150, 2))),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare_values(&SqlValue::Float(1.5), &SqlValue::Int(1)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_compare_dates_and_text_dates() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            compare_values(&SqlValue::Date(d), &SqlValue::from("2024-02-28")),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_null_and_incomparable() {
        assert_eq!(compare_values(&SqlValue::Null, &SqlValue::Int(1)), None);
        assert_eq!(compare_values(&SqlValue::Bool(true), &SqlValue::Int(1)), None);
        assert_eq!(CompareOp::Ge.holds(&SqlValue::Null, &SqlValue::Int(1)), None);
    }

    #[test]
    fn test_op_flip_and_holds() {
        assert_eq!(CompareOp::Lt.flip(), CompareOp::Gt);
        assert_eq!(CompareOp::Eq.flip(), CompareOp::Eq);
        assert_eq!(CompareOp::Le.holds(&SqlValue::Int(3), &SqlValue::Int(3)), Some(true));
        assert_eq!(CompareOp::Lt.holds(&SqlValue::Int(3), &SqlValue::Int(3)), Some(false));
        assert_eq!(CompareOp::parse("!="), Some(CompareOp::Ne));
    }

    #[test]
    fn test_rule_columns() {
        let rule = ConstraintRule::CrossFieldCompare {
            constraint: "loan_dates".into(),
            column: "due_date".into(),
            op: CompareOp::Ge,
            other: "loan_date".into(),
            null_guarded: false,
        };
        assert_eq!(rule.columns(), vec!["due_date", "loan_date"]);
        assert_eq!(rule.to_string(), "due_date >= loan_date");
    }
}
