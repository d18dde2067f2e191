//! Core abstractions shared by every component.
//!
//! - [`schema`]: Table, column, index and constraint descriptors
//! - [`kind`]: The closed set of semantic column kinds
//! - [`value`]: SQL values, caller row maps and result records
//! - [`identifier`]: Identifier quoting and DDL text validation
//! - [`traits`]: The `Store` and `SchemaReader` seams

pub mod identifier;
pub mod kind;
pub mod schema;
pub mod traits;
pub mod value;

pub use kind::ColumnKind;
pub use schema::{CheckConstraint, ColumnDescriptor, ForeignKey, Index, TableDescriptor};
pub use traits::{SchemaReader, Store};
pub use value::{row, Record, RowMap, SqlValue};
