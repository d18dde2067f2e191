//! Schema metadata types for tables, columns, indexes and constraints.
//!
//! A [`TableDescriptor`] is owned by one catalog snapshot and is never
//! mutated after the snapshot is published.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::kind::ColumnKind;
use crate::constraints::ConstraintRule;

/// Table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Schema name.
    pub schema: String,

    /// Table name.
    pub name: String,

    /// Column definitions, in ordinal order.
    pub columns: Vec<ColumnDescriptor>,

    /// Primary key column names.
    pub primary_key: Vec<String>,

    /// Column groups covered by UNIQUE constraints (primary key excluded).
    pub unique_constraints: Vec<Vec<String>>,

    /// Foreign key constraints declared on this table.
    pub foreign_keys: Vec<ForeignKey>,

    /// Indexes, including the primary key index.
    pub indexes: Vec<Index>,

    /// CHECK constraints as printed by the server.
    pub check_constraints: Vec<CheckConstraint>,

    /// Rules interpreted from the CHECK constraints, keyed by column.
    #[serde(default)]
    pub rules: BTreeMap<String, Vec<ConstraintRule>>,
}

impl TableDescriptor {
    /// Create an empty descriptor.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            unique_constraints: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            check_constraints: Vec::new(),
            rules: BTreeMap::new(),
        }
    }

    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// The primary key column when the key is a single integer column.
    pub fn single_integer_pk(&self) -> Option<&ColumnDescriptor> {
        match self.primary_key.as_slice() {
            [pk] => self.column(pk).filter(|c| c.kind.is_integer()),
            _ => None,
        }
    }

    /// Single-column foreign key on `column`, if any.
    pub fn foreign_key_for(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.columns.len() == 1 && fk.columns[0] == column)
    }

    /// Whether `column` takes part in any foreign key of this table.
    pub fn is_fk_column(&self, column: &str) -> bool {
        self.foreign_keys
            .iter()
            .any(|fk| fk.columns.iter().any(|c| c == column))
    }

    /// Whether `column` is covered by a single-column UNIQUE constraint.
    pub fn is_unique_column(&self, column: &str) -> bool {
        self.unique_constraints
            .iter()
            .any(|group| group.len() == 1 && group[0] == column)
    }

    /// Interpreted rules for a column.
    pub fn rules_for(&self, column: &str) -> &[ConstraintRule] {
        self.rules.get(column).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Column metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,

    /// Semantic kind, decided once at catalog build.
    pub kind: ColumnKind,

    /// Type as printed by `format_type` (e.g. "character varying(120)").
    pub sql_type: String,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Default expression, if any.
    pub default: Option<String>,

    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,

    /// Identity column or sequence-backed default.
    pub is_autoincrement: bool,

    /// Ordinal position (1-based).
    pub ordinal_pos: i32,
}

impl ColumnDescriptor {
    /// Whether the server fills the column when it is omitted.
    pub fn has_default(&self) -> bool {
        self.default.is_some() || self.is_autoincrement
    }

    /// NOT NULL with nothing to fill it in.
    pub fn is_required(&self) -> bool {
        !self.is_nullable && !self.has_default()
    }
}

/// Index metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,

    /// Indexed column names.
    pub columns: Vec<String>,

    /// Whether the index is unique.
    pub is_unique: bool,

    /// Whether the index backs the primary key.
    pub is_primary: bool,
}

/// Foreign key metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Source column names.
    pub columns: Vec<String>,

    /// Referenced table name.
    pub ref_table: String,

    /// Referenced schema name.
    pub ref_schema: String,

    /// Referenced column names.
    pub ref_columns: Vec<String>,

    /// ON DELETE action.
    pub on_delete: String,

    /// ON UPDATE action.
    pub on_update: String,
}

/// Check constraint metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConstraint {
    /// Constraint name.
    pub name: String,

    /// Constraint definition as printed by `pg_get_constraintdef`.
    pub definition: String,
}
