//! Row validation against the catalog.
//!
//! Checks run in a fixed order: unknown columns, required columns, kind
//! compatibility, enum membership, single-column rules, then multi-column
//! rules. A value that fails its kind check is not examined further.
//!
//! Multi-column rules are evaluated only when every column they read is
//! present in the row. For an update touching one side of a cross-field
//! rule the other side lives in the stored row, which is not read back, so
//! the rule is skipped and the server's CHECK remains the final word.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::constraints::{compare_values, CompareOp, ConstraintRule};
use crate::core::kind::ColumnKind;
use crate::core::schema::{ColumnDescriptor, TableDescriptor};
use crate::core::value::{RowMap, SqlValue};

static RE_CHAR_LENGTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:character varying|varchar|character|char|bpchar)\((\d+)\)$")
        .expect("valid regex")
});

/// Which statement the row is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Every required column must be supplied.
    Insert,
    /// Only the supplied columns are checked.
    Update,
}

/// Category of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// NOT NULL column without default is missing.
    Required,
    /// Explicit NULL for a NOT NULL column.
    NotNull,
    /// Value incompatible with the column kind.
    Kind,
    /// Text longer than the declared character length.
    Length,
    /// Value outside the enum's labels.
    Enum,
    Range,
    Membership,
    CrossField,
    EqualOrBothNull,
    NullConsistency,
    /// Column not present in the table.
    UnknownColumn,
    /// Referenced row does not exist.
    ForeignKey,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::Required => "required",
            ViolationKind::NotNull => "not_null",
            ViolationKind::Kind => "kind",
            ViolationKind::Length => "length",
            ViolationKind::Enum => "enum",
            ViolationKind::Range => "range",
            ViolationKind::Membership => "membership",
            ViolationKind::CrossField => "cross_field",
            ViolationKind::EqualOrBothNull => "equal_or_both_null",
            ViolationKind::NullConsistency => "null_consistency",
            ViolationKind::UnknownColumn => "unknown_column",
            ViolationKind::ForeignKey => "foreign_key",
        };
        f.write_str(name)
    }
}

/// One violated rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub column: String,
    pub rule: ViolationKind,
    pub reason: String,
    /// CHECK constraint the rule was interpreted from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
}

impl Violation {
    pub fn new(column: impl Into<String>, rule: ViolationKind, reason: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            rule,
            reason: reason.into(),
            constraint: None,
        }
    }

    fn from_rule(rule: &ConstraintRule, kind: ViolationKind, reason: String) -> Self {
        Self {
            column: rule.column().to_string(),
            rule: kind,
            reason,
            constraint: Some(rule.constraint().to_string()),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.column, self.rule, self.reason)
    }
}

/// Checks candidate rows against a table descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Every violation of `row` against `table`; empty means valid.
    pub fn validate(&self, table: &TableDescriptor, row: &RowMap, mode: ValidationMode) -> Vec<Violation> {
        let mut violations = Vec::new();

        for name in row.keys() {
            if !table.has_column(name) {
                violations.push(Violation::new(
                    name.as_str(),
                    ViolationKind::UnknownColumn,
                    format!("table '{}' has no column '{}'", table.name, name),
                ));
            }
        }

        let mut rejected: BTreeSet<&str> = BTreeSet::new();
        for column in &table.columns {
            let value = row.get(&column.name);
            if is_generated_key(table, column) && value.map_or(true, SqlValue::is_null) {
                continue;
            }
            match (mode, value) {
                (ValidationMode::Insert, None) if column.is_required() => {
                    violations.push(Violation::new(
                        column.name.as_str(),
                        ViolationKind::Required,
                        "a value is required",
                    ));
                    rejected.insert(&column.name);
                }
                (_, Some(SqlValue::Null)) if !column.is_nullable => {
                    violations.push(Violation::new(
                        column.name.as_str(),
                        ViolationKind::NotNull,
                        "NULL is not allowed",
                    ));
                    rejected.insert(&column.name);
                }
                (_, Some(v)) if !v.is_null() => {
                    if let Some(violation) = check_value(column, v) {
                        violations.push(violation);
                        rejected.insert(&column.name);
                    }
                }
                _ => {}
            }
        }

        for rule in table.rules.values().flatten() {
            if rule.columns().iter().any(|c| rejected.contains(c)) {
                continue;
            }
            if let Some(violation) = check_rule(rule, row) {
                violations.push(violation);
            }
        }

        violations
    }
}

/// Primary key the server or the id allocator fills when it is omitted.
pub fn is_generated_key(table: &TableDescriptor, column: &ColumnDescriptor) -> bool {
    column.is_primary_key
        && (column.is_autoincrement
            || table
                .single_integer_pk()
                .is_some_and(|pk| pk.name == column.name))
}

fn check_value(column: &ColumnDescriptor, value: &SqlValue) -> Option<Violation> {
    if !column.kind.accepts(value) {
        return Some(Violation::new(
            column.name.as_str(),
            ViolationKind::Kind,
            format!("expected {}, got {}", column.kind, value.type_name()),
        ));
    }

    if let Some(labels) = column.kind.enum_values() {
        return check_label(column, labels, value);
    }
    if let ColumnKind::Array { element } = &column.kind {
        if let (Some(labels), SqlValue::Array(items)) = (element.enum_values(), value) {
            return items
                .iter()
                .filter(|item| !item.is_null())
                .find_map(|item| check_label(column, labels, item));
        }
    }

    if let (Some(max), SqlValue::Text(s)) = (declared_length(&column.sql_type), value) {
        let len = s.chars().count();
        if len > max {
            return Some(Violation::new(
                column.name.as_str(),
                ViolationKind::Length,
                format!("{} characters exceeds the limit of {}", len, max),
            ));
        }
    }
    None
}

fn check_label(column: &ColumnDescriptor, labels: &[String], value: &SqlValue) -> Option<Violation> {
    let text = value.to_text().unwrap_or_default();
    if labels.iter().any(|l| *l == text) {
        return None;
    }
    Some(Violation::new(
        column.name.as_str(),
        ViolationKind::Enum,
        format!("'{}' is not one of: {}", text, labels.join(", ")),
    ))
}

fn declared_length(sql_type: &str) -> Option<usize> {
    RE_CHAR_LENGTH
        .captures(sql_type)
        .and_then(|c| c[1].parse().ok())
}

fn check_rule(rule: &ConstraintRule, row: &RowMap) -> Option<Violation> {
    // Every column the rule reads must be in the row.
    let values: Vec<&SqlValue> = rule
        .columns()
        .iter()
        .map(|c| row.get(*c))
        .collect::<Option<_>>()?;

    match rule {
        ConstraintRule::Range { min, max, .. } => {
            let value = values[0];
            let n = value.as_f64()?;
            if let Some(b) = min {
                if n < b.value || (!b.inclusive && n == b.value) {
                    let bound = if b.inclusive { "minimum" } else { "exclusive minimum" };
                    return Some(Violation::from_rule(
                        rule,
                        ViolationKind::Range,
                        format!("value {} is below {} {}", value.to_text()?, bound, b.value),
                    ));
                }
            }
            if let Some(b) = max {
                if n > b.value || (!b.inclusive && n == b.value) {
                    let bound = if b.inclusive { "maximum" } else { "exclusive maximum" };
                    return Some(Violation::from_rule(
                        rule,
                        ViolationKind::Range,
                        format!("value {} is above {} {}", value.to_text()?, bound, b.value),
                    ));
                }
            }
            None
        }
        ConstraintRule::Membership { values: allowed, .. } => {
            let value = values[0];
            let text = value.to_text()?;
            let found = allowed.iter().any(|a| {
                *a == text
                    || match (a.parse::<f64>(), value.as_f64()) {
                        (Ok(x), Some(y)) => x == y,
                        _ => false,
                    }
            });
            (!found).then(|| {
                Violation::from_rule(
                    rule,
                    ViolationKind::Membership,
                    format!("'{}' is not one of: {}", text, allowed.join(", ")),
                )
            })
        }
        ConstraintRule::CrossFieldCompare {
            column,
            op,
            other,
            null_guarded,
            ..
        } => {
            let (left, right) = (values[0], values[1]);
            if *null_guarded && left.is_null() {
                return None;
            }
            match op.holds(left, right) {
                Some(false) => Some(Violation::from_rule(
                    rule,
                    ViolationKind::CrossField,
                    format!("{} ({}) must be {} {} ({})", column, left, op, other, right),
                )),
                _ => None,
            }
        }
        ConstraintRule::EqualOrBothNull { column, other, .. } => {
            let (left, right) = (values[0], values[1]);
            let ok = match (left.is_null(), right.is_null()) {
                (true, true) => true,
                (false, false) => compare_values(left, right)
                    .map_or(true, |_| CompareOp::Eq.holds(left, right) == Some(true)),
                _ => false,
            };
            (!ok).then(|| {
                Violation::from_rule(
                    rule,
                    ViolationKind::EqualOrBothNull,
                    format!("{} must equal {} or both must be NULL", column, other),
                )
            })
        }
        ConstraintRule::NullConsistency { columns, .. } => {
            let nulls: Vec<&str> = columns
                .iter()
                .zip(&values)
                .filter(|(_, v)| v.is_null())
                .map(|(c, _)| c.as_str())
                .collect();
            if nulls.is_empty() || nulls.len() == columns.len() {
                return None;
            }
            Some(Violation::from_rule(
                rule,
                ViolationKind::NullConsistency,
                format!(
                    "{} must be all NULL or all set (NULL: {})",
                    columns.join(", "),
                    nulls.join(", ")
                ),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::row;
    use crate::testing::library_snapshot;
    use chrono::NaiveDate;

    fn validate(table: &str, r: RowMap, mode: ValidationMode) -> Vec<Violation> {
        let snapshot = library_snapshot();
        Validator::new().validate(snapshot.table(table).unwrap(), &r, mode)
    }

    fn date(y: i32, m: u32, d: u32) -> SqlValue {
        SqlValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn test_valid_book() {
        let r = row([
            ("title", SqlValue::from("Dune")),
            ("genre", SqlValue::from("fiction")),
            ("price", SqlValue::Float(9.99)),
        ]);
        assert!(validate("books", r, ValidationMode::Insert).is_empty());
    }

    #[test]
    fn test_missing_required_column() {
        let r = row([("genre", "fiction")]);
        let v = validate("books", r, ValidationMode::Insert);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].column, "title");
        assert_eq!(v[0].rule, ViolationKind::Required);
    }

    #[test]
    fn test_every_required_column_reported() {
        let v = validate("loan_records", RowMap::new(), ValidationMode::Insert);
        let columns: Vec<&str> = v.iter().map(|x| x.column.as_str()).collect();
        assert_eq!(columns, vec!["book_id", "reader_id"]);
    }

    #[test]
    fn test_update_does_not_require_columns() {
        let r = row([("price", SqlValue::Float(12.0))]);
        assert!(validate("books", r, ValidationMode::Update).is_empty());
    }

    #[test]
    fn test_explicit_null_for_not_null_with_default() {
        let r = row([
            ("title", SqlValue::from("Dune")),
            ("genre", SqlValue::from("fiction")),
            ("copies", SqlValue::Null),
        ]);
        let v = validate("books", r, ValidationMode::Insert);
        assert_eq!(v[0].rule, ViolationKind::NotNull);
        assert_eq!(v[0].column, "copies");
    }

    #[test]
    fn test_string_for_integer_rejected() {
        let r = row([
            ("title", SqlValue::from("Dune")),
            ("genre", SqlValue::from("fiction")),
            ("copies", SqlValue::from("three")),
        ]);
        let v = validate("books", r, ValidationMode::Insert);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].rule, ViolationKind::Kind);
        assert!(v[0].reason.contains("expected integer"));
    }

    #[test]
    fn test_enum_outside_labels() {
        let r = row([("genre", "cookbook")]);
        let v = validate("books", r, ValidationMode::Update);
        assert_eq!(v[0].rule, ViolationKind::Enum);
        assert!(v[0].reason.contains("fiction"));
    }

    #[test]
    fn test_length_limit() {
        let r = row([("isbn", "x".repeat(21))]);
        let v = validate("books", r, ValidationMode::Update);
        assert_eq!(v[0].rule, ViolationKind::Length);
    }

    #[test]
    fn test_negative_deposit_is_range_violation() {
        let r = row([
            ("full_name", SqlValue::from("Ada")),
            ("deposit_amount", SqlValue::Int(-5)),
        ]);
        let v = validate("readers", r, ValidationMode::Insert);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].column, "deposit_amount");
        assert_eq!(v[0].rule, ViolationKind::Range);
        assert_eq!(v[0].constraint.as_deref(), Some("readers_deposit_amount_check"));
    }

    #[test]
    fn test_null_consistency_violation() {
        let r = row([
            ("book_id", SqlValue::Int(1)),
            ("reader_id", SqlValue::Int(1)),
            ("loan_date", date(2024, 1, 10)),
            ("actual_return_date", date(2024, 1, 20)),
            ("final_rental_cost", SqlValue::Null),
            ("actual_rental_days", SqlValue::Int(10)),
        ]);
        let v = validate("loan_records", r, ValidationMode::Insert);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].rule, ViolationKind::NullConsistency);
        assert!(v[0].reason.contains("final_rental_cost"));
    }

    #[test]
    fn test_multi_column_rule_skipped_when_column_absent() {
        let r = row([
            ("actual_return_date", date(2024, 1, 20)),
            ("final_rental_cost", SqlValue::Null),
        ]);
        assert!(validate("loan_records", r, ValidationMode::Update).is_empty());
    }

    #[test]
    fn test_cross_field_compare() {
        let r = row([
            ("loan_date", date(2024, 2, 1)),
            ("actual_return_date", SqlValue::from("2024-01-15")),
            ("final_rental_cost", SqlValue::Int(0)),
            ("actual_rental_days", SqlValue::Int(1)),
        ]);
        let v = validate("loan_records", r, ValidationMode::Update);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].rule, ViolationKind::CrossField);
        assert_eq!(v[0].column, "actual_return_date");
    }

    #[test]
    fn test_null_guard_allows_null() {
        let r = row([
            ("loan_date", date(2024, 2, 1)),
            ("actual_return_date", SqlValue::Null),
        ]);
        assert!(validate("loan_records", r, ValidationMode::Update).is_empty());
    }

    #[test]
    fn test_unknown_column_on_insert() {
        let r = row([
            ("title", SqlValue::from("Dune")),
            ("genre", SqlValue::from("fiction")),
            ("colour", SqlValue::from("blue")),
        ]);
        let v = validate("books", r, ValidationMode::Insert);
        assert_eq!(v[0].rule, ViolationKind::UnknownColumn);
    }

    #[test]
    fn test_generated_key_may_be_omitted_or_null() {
        let r = row([
            ("reader_id", SqlValue::Null),
            ("full_name", SqlValue::from("Ada")),
        ]);
        assert!(validate("readers", r, ValidationMode::Insert).is_empty());
    }

    #[test]
    fn test_kind_failure_suppresses_rules_on_that_column() {
        let r = row([
            ("full_name", SqlValue::from("Ada")),
            ("deposit_amount", SqlValue::from("lots")),
        ]);
        let v = validate("readers", r, ValidationMode::Insert);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].rule, ViolationKind::Kind);
    }

    #[test]
    fn test_equal_or_both_null_rule() {
        let rule = ConstraintRule::EqualOrBothNull {
            constraint: "c".into(),
            column: "a".into(),
            other: "b".into(),
        };
        assert!(check_rule(&rule, &row([("a", SqlValue::Null), ("b", SqlValue::Null)])).is_none());
        assert!(check_rule(&rule, &row([("a", 1), ("b", 1)])).is_none());
        assert!(check_rule(&rule, &row([("a", SqlValue::Int(1)), ("b", SqlValue::Null)])).is_some());
        assert!(check_rule(&rule, &row([("a", 1), ("b", 2)])).is_some());
    }

    #[test]
    fn test_membership_numeric_match() {
        let rule = ConstraintRule::Membership {
            constraint: "c".into(),
            column: "shelf".into(),
            values: vec!["1".into(), "2".into()],
        };
        assert!(check_rule(&rule, &row([("shelf", SqlValue::Float(2.0))])).is_none());
        assert!(check_rule(&rule, &row([("shelf", 3)])).is_some());
    }
}
