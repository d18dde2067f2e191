//! Pattern matching over printed CHECK constraint text.
//!
//! This is not an expression evaluator. The definition is normalized (the
//! `CHECK` wrapper, casts and redundant parentheses PostgreSQL adds when it
//! prints a constraint are removed), split into top-level conjuncts, and each
//! conjunct is tried against the recognized shapes in a fixed order:
//!
//! 1. null-guarded compare: `(a IS NULL) OR (a OP b)`
//! 2. cross-field compare: `a OP b`
//! 3. equal or both null: `(a = b) OR (a IS NULL AND b IS NULL)`
//! 4. null consistency: `(a IS NULL AND b IS NULL) OR (a IS NOT NULL AND b IS NOT NULL)`
//! 5. range: `a >= 0`, `a BETWEEN 1 AND 5`, `a > 0 AND a <= 10`
//! 6. membership: `a IN (...)`, `a = ANY (ARRAY[...])`
//!
//! The first shape that matches wins. A conjunct matching none of them, or
//! naming an identifier that is not a column of the table, yields no rule.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::trace;

use super::{Bound, CompareOp, ConstraintRule};
use crate::core::schema::TableDescriptor;

static RE_CHECK_WRAPPER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*CHECK\s*(.*?)\s*(?:NOT\s+VALID)?\s*$").expect("valid regex")
});
static RE_CAST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)::\s*(?:"[^"]+"|character varying|double precision|timestamp(?:\(\d+\))? with(?:out)? time zone|time with(?:out)? time zone|[a-z_][a-z0-9_]*)(?:\(\d+(?:,\s*\d+)?\))?(?:\[\])?"#,
    )
    .expect("valid regex")
});
static RE_PAREN_ATOM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\(\s*(-?\d+(?:\.\d+)?|'(?:[^']|'')*'|[A-Za-z_][A-Za-z0-9_$]*)\s*\)")
        .expect("valid regex")
});
static RE_QUOTED_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]*)""#).expect("valid regex"));
static RE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_$]*").expect("valid regex"));
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static RE_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("valid regex"));
static RE_COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+?)\s*(>=|<=|<>|!=|=|>|<)\s*(\S+)$").expect("valid regex")
});
static RE_IS_NULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([A-Za-z_][A-Za-z0-9_$]*)\s+IS\s+(NOT\s+)?NULL$").expect("valid regex")
});
static RE_BETWEEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([A-Za-z_][A-Za-z0-9_$]*)\s+BETWEEN\s+(\S+)\s+AND\s+(\S+)$")
        .expect("valid regex")
});
static RE_IN_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^([A-Za-z_][A-Za-z0-9_$]*)\s+IN\s*\((.*)\)$").expect("valid regex")
});
static RE_ANY_ARRAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^([A-Za-z_][A-Za-z0-9_$]*)\s*=\s*ANY\s*(?:\(\s*)+ARRAY\s*\[(.*)\](?:\s*\))+$")
        .expect("valid regex")
});

const KEYWORDS: &[&str] = &[
    "null",
    "true",
    "false",
    "and",
    "or",
    "not",
    "current_date",
    "current_timestamp",
    "now",
];

/// Interpret every CHECK constraint of a table, keyed by owning column.
pub fn interpret_table(table: &TableDescriptor) -> BTreeMap<String, Vec<ConstraintRule>> {
    let columns = table.column_names();
    let mut rules: BTreeMap<String, Vec<ConstraintRule>> = BTreeMap::new();
    for check in &table.check_constraints {
        for rule in interpret_check(&check.name, &check.definition, &columns) {
            rules.entry(rule.column().to_string()).or_default().push(rule);
        }
    }
    rules
}

/// Interpret one CHECK definition against the table's column names.
pub fn interpret_check(constraint: &str, definition: &str, columns: &[String]) -> Vec<ConstraintRule> {
    let expr = normalize(definition);
    trace!(constraint, normalized = %expr, "interpreting check");

    let mut rules = Vec::new();
    for conjunct in split_top(&expr, "AND") {
        let ctx = Conjunct {
            constraint,
            columns,
        };
        if let Some(rule) = ctx.classify(strip_parens(conjunct)) {
            rules.push(rule);
        }
    }
    merge_ranges(rules)
}

struct Conjunct<'a> {
    constraint: &'a str,
    columns: &'a [String],
}

impl Conjunct<'_> {
    fn classify(&self, expr: &str) -> Option<ConstraintRule> {
        self.null_guarded_compare(expr)
            .or_else(|| self.cross_field_compare(expr))
            .or_else(|| self.equal_or_both_null(expr))
            .or_else(|| self.null_consistency(expr))
            .or_else(|| self.range(expr))
            .or_else(|| self.membership(expr))
    }

    fn is_column(&self, ident: &str) -> bool {
        self.columns.iter().any(|c| c == ident)
    }

    /// `col OP other` where both sides are columns, oriented so `owner` is on the left.
    fn column_compare(&self, expr: &str, owner: Option<&str>) -> Option<(String, CompareOp, String)> {
        let (left, op, right) = parse_comparison(expr)?;
        if !is_identifier(left) || !is_identifier(right) {
            return None;
        }
        if !self.is_column(left) || !self.is_column(right) || left == right {
            return None;
        }
        match owner {
            Some(o) if o == right => Some((right.to_string(), op.flip(), left.to_string())),
            Some(o) if o != left => None,
            _ => Some((left.to_string(), op, right.to_string())),
        }
    }

    fn null_guarded_compare(&self, expr: &str) -> Option<ConstraintRule> {
        let parts = split_top(expr, "OR");
        let [a, b] = parts.as_slice() else {
            return None;
        };
        for (guard, compare) in [(a, b), (b, a)] {
            let Some((column, false)) = parse_is_null(strip_parens(guard)) else {
                continue;
            };
            if !self.is_column(column) {
                continue;
            }
            if let Some((column, op, other)) = self.column_compare(strip_parens(compare), Some(column)) {
                return Some(ConstraintRule::CrossFieldCompare {
                    constraint: self.constraint.to_string(),
                    column,
                    op,
                    other,
                    null_guarded: true,
                });
            }
        }
        None
    }

    fn cross_field_compare(&self, expr: &str) -> Option<ConstraintRule> {
        let (column, op, other) = self.column_compare(expr, None)?;
        Some(ConstraintRule::CrossFieldCompare {
            constraint: self.constraint.to_string(),
            column,
            op,
            other,
            null_guarded: false,
        })
    }

    fn equal_or_both_null(&self, expr: &str) -> Option<ConstraintRule> {
        let parts = split_top(expr, "OR");
        let [a, b] = parts.as_slice() else {
            return None;
        };
        for (equality, nulls) in [(a, b), (b, a)] {
            let Some((column, CompareOp::Eq, other)) = self.column_compare(strip_parens(equality), None) else {
                continue;
            };
            let null_columns = null_clauses(strip_parens(nulls))?;
            let all_null = null_columns.iter().all(|(_, not)| !not);
            let mut names: Vec<&str> = null_columns.iter().map(|(c, _)| *c).collect();
            names.sort_unstable();
            let mut expected = vec![column.as_str(), other.as_str()];
            expected.sort_unstable();
            if all_null && names == expected {
                return Some(ConstraintRule::EqualOrBothNull {
                    constraint: self.constraint.to_string(),
                    column,
                    other,
                });
            }
        }
        None
    }

    fn null_consistency(&self, expr: &str) -> Option<ConstraintRule> {
        let parts = split_top(expr, "OR");
        let [a, b] = parts.as_slice() else {
            return None;
        };
        let first = null_clauses(strip_parens(a))?;
        let second = null_clauses(strip_parens(b))?;

        let (nulls, not_nulls) = if first.iter().all(|(_, not)| !not) {
            (first, second)
        } else {
            (second, first)
        };
        if nulls.len() < 2
            || nulls.iter().any(|(_, not)| *not)
            || not_nulls.iter().any(|(_, not)| !not)
        {
            return None;
        }

        let columns: Vec<String> = nulls.iter().map(|(c, _)| c.to_string()).collect();
        let mut lhs: Vec<&str> = nulls.iter().map(|(c, _)| *c).collect();
        let mut rhs: Vec<&str> = not_nulls.iter().map(|(c, _)| *c).collect();
        lhs.sort_unstable();
        lhs.dedup();
        rhs.sort_unstable();
        rhs.dedup();
        if lhs != rhs || lhs.len() != columns.len() || !columns.iter().all(|c| self.is_column(c)) {
            return None;
        }

        Some(ConstraintRule::NullConsistency {
            constraint: self.constraint.to_string(),
            columns,
        })
    }

    fn range(&self, expr: &str) -> Option<ConstraintRule> {
        if let Some(caps) = RE_BETWEEN.captures(expr) {
            let column = &caps[1];
            let low = parse_number(&caps[2])?;
            let high = parse_number(&caps[3])?;
            if !self.is_column(column) {
                return None;
            }
            return Some(ConstraintRule::Range {
                constraint: self.constraint.to_string(),
                column: column.to_string(),
                min: Some(Bound::inclusive(low)),
                max: Some(Bound::inclusive(high)),
            });
        }

        let (left, op, right) = parse_comparison(expr)?;
        let (column, op, value) = match (is_identifier(left), parse_number(right)) {
            (true, Some(n)) => (left, op, n),
            _ => match (parse_number(left), is_identifier(right)) {
                (Some(n), true) => (right, op.flip(), n),
                _ => return None,
            },
        };
        if !self.is_column(column) {
            return None;
        }
        let (min, max) = match op {
            CompareOp::Ge => (Some(Bound::inclusive(value)), None),
            CompareOp::Gt => (Some(Bound::exclusive(value)), None),
            CompareOp::Le => (None, Some(Bound::inclusive(value))),
            CompareOp::Lt => (None, Some(Bound::exclusive(value))),
            _ => return None,
        };
        Some(ConstraintRule::Range {
            constraint: self.constraint.to_string(),
            column: column.to_string(),
            min,
            max,
        })
    }

    fn membership(&self, expr: &str) -> Option<ConstraintRule> {
        let caps = RE_IN_LIST
            .captures(expr)
            .or_else(|| RE_ANY_ARRAY.captures(expr))?;
        let column = &caps[1];
        if !self.is_column(column) {
            return None;
        }
        let values = parse_list(&caps[2])?;
        if values.is_empty() {
            return None;
        }
        Some(ConstraintRule::Membership {
            constraint: self.constraint.to_string(),
            column: column.to_string(),
            values,
        })
    }
}

/// Merge range conjuncts of one constraint on the same column into a single rule.
fn merge_ranges(rules: Vec<ConstraintRule>) -> Vec<ConstraintRule> {
    let mut merged: Vec<ConstraintRule> = Vec::with_capacity(rules.len());
    for rule in rules {
        if let ConstraintRule::Range {
            column, min, max, ..
        } = &rule
        {
            let existing = merged.iter_mut().find_map(|r| match r {
                ConstraintRule::Range {
                    column: c,
                    min: m,
                    max: x,
                    ..
                } if c == column => Some((m, x)),
                _ => None,
            });
            if let Some((m, x)) = existing {
                *m = tighter(*m, *min, |a, b| a.value > b.value);
                *x = tighter(*x, *max, |a, b| a.value < b.value);
                continue;
            }
        }
        merged.push(rule);
    }
    merged
}

fn tighter(current: Option<Bound>, new: Option<Bound>, stricter: impl Fn(&Bound, &Bound) -> bool) -> Option<Bound> {
    match (current, new) {
        (Some(a), Some(b)) => {
            if stricter(&b, &a) || (a.value == b.value && !b.inclusive) {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, b) => a.or(b),
    }
}

/// Whether a CHECK definition mentions `column`, quoted or bare.
pub fn mentions_column(definition: &str, column: &str) -> bool {
    if definition.contains(&format!("\"{}\"", column.replace('"', "\"\""))) {
        return true;
    }
    RE_WORD
        .find_iter(&normalize(definition))
        .any(|m| m.as_str() == column)
}

/// Strip the printed wrapper, casts, redundant parentheses and identifier quotes.
pub fn normalize(definition: &str) -> String {
    let mut expr = match RE_CHECK_WRAPPER.captures(definition) {
        Some(caps) => caps[1].to_string(),
        None => definition.to_string(),
    };
    expr = RE_CAST.replace_all(&expr, "").into_owned();
    expr = RE_QUOTED_IDENT.replace_all(&expr, "$1").into_owned();

    // `(0)`, `('x')` and `(col)` lose their parentheses unless they are the
    // argument list of a function or an IN list.
    for _ in 0..8 {
        let next = RE_PAREN_ATOM
            .replace_all(&expr, |caps: &Captures<'_>| {
                let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
                let preceding = expr[..start].trim_end().chars().last();
                match preceding {
                    Some(c) if c.is_alphanumeric() || c == '_' => caps[0].to_string(),
                    _ => caps[1].to_string(),
                }
            })
            .into_owned();
        if next == expr {
            break;
        }
        expr = next;
    }

    let expr = RE_WHITESPACE.replace_all(expr.trim(), " ");
    strip_parens(&expr).to_string()
}

/// Remove parentheses that enclose the whole expression.
fn strip_parens(mut expr: &str) -> &str {
    loop {
        expr = expr.trim();
        if !(expr.starts_with('(') && expr.ends_with(')')) {
            return expr;
        }
        if matching_close(expr) != Some(expr.len() - 1) {
            return expr;
        }
        expr = &expr[1..expr.len() - 1];
    }
}

fn matching_close(expr: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quote = false;
    for (i, ch) in expr.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on a keyword occurring outside parentheses and string literals.
///
/// When splitting on `AND`, the `AND` belonging to a `BETWEEN` is skipped.
fn split_top<'a>(expr: &'a str, keyword: &str) -> Vec<&'a str> {
    let bytes = expr.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut between_pending = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let ch = bytes[i];
        match ch {
            b'\'' => in_quote = !in_quote,
            b'(' if !in_quote => depth += 1,
            b')' if !in_quote => depth -= 1,
            _ if !in_quote && depth == 0 && word_at(expr, i, "BETWEEN") => {
                between_pending = true;
                i += "BETWEEN".len();
                continue;
            }
            _ if !in_quote && depth == 0 && word_at(expr, i, keyword) => {
                if keyword.eq_ignore_ascii_case("AND") && between_pending {
                    between_pending = false;
                } else {
                    parts.push(expr[start..i].trim());
                    start = i + keyword.len();
                }
                i += keyword.len();
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(expr[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

fn word_at(expr: &str, i: usize, word: &str) -> bool {
    let bytes = expr.as_bytes();
    let end = i + word.len();
    if end > bytes.len() || !bytes[i..end].eq_ignore_ascii_case(word.as_bytes()) {
        return false;
    }
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$';
    let before_ok = i == 0 || !is_word(bytes[i - 1]);
    let after_ok = end == bytes.len() || !is_word(bytes[end]);
    before_ok && after_ok
}

fn parse_comparison(expr: &str) -> Option<(&str, CompareOp, &str)> {
    let caps = RE_COMPARISON.captures(expr)?;
    let left = caps.get(1)?.as_str();
    let right = caps.get(3)?.as_str();
    Some((left, CompareOp::parse(caps.get(2)?.as_str())?, right))
}

/// `(column, is_not)` for an `X IS [NOT] NULL` clause.
fn parse_is_null(expr: &str) -> Option<(&str, bool)> {
    let caps = RE_IS_NULL.captures(expr)?;
    Some((caps.get(1)?.as_str(), caps.get(2).is_some()))
}

/// Every conjunct of `expr` as an IS [NOT] NULL clause, or `None`.
fn null_clauses(expr: &str) -> Option<Vec<(&str, bool)>> {
    split_top(expr, "AND")
        .into_iter()
        .map(|part| parse_is_null(strip_parens(part)))
        .collect()
}

fn is_identifier(token: &str) -> bool {
    RE_IDENT.is_match(token) && !KEYWORDS.contains(&token.to_ascii_lowercase().as_str())
}

fn parse_number(token: &str) -> Option<f64> {
    token
        .trim()
        .trim_matches('\'')
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
}

/// Values of an IN list or ARRAY literal; `None` if an element is not a literal.
fn parse_list(list: &str) -> Option<Vec<String>> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut quoted = false;
    let mut chars = list.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if in_quote && chars.peek() == Some(&'\'') => {
                current.push('\'');
                chars.next();
            }
            '\'' => {
                in_quote = !in_quote;
                quoted = true;
            }
            ',' if !in_quote => {
                values.push(list_element(&current, quoted)?);
                current.clear();
                quoted = false;
            }
            _ => current.push(ch),
        }
    }
    if in_quote {
        return None;
    }
    if !current.trim().is_empty() || quoted {
        values.push(list_element(&current, quoted)?);
    }
    Some(values)
}

fn list_element(raw: &str, quoted: bool) -> Option<String> {
    if quoted {
        return Some(raw.trim().to_string());
    }
    let token = raw.trim();
    parse_number(token).map(|_| token.to_string())
}
