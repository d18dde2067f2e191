//! # relguard
//!
//! Schema-aware data access and phased DDL for PostgreSQL.
//!
//! The library reflects a live schema into an immutable catalog and uses it
//! to guard every statement it issues:
//!
//! - **Validation before SQL**: NOT NULL, type, enum, length and rules
//!   interpreted from CHECK constraints are checked client-side
//! - **Parameterized CRUD and joins** built only from catalog identifiers
//! - **Integer key allocation** reusing the smallest free id, or `max+1`
//! - **Phased DDL** with NULL/duplicate pre-checks, dependency detection
//!   and a phase journal
//!
//! ## Example
//!
//! ```rust,no_run
//! use relguard::{row, Config, Guard, SqlValue};
//!
//! #[tokio::main]
//! async fn main() -> relguard::Result<()> {
//!     let config = Config::load("relguard.yaml")?;
//!     let guard = Guard::connect(&config).await?;
//!     let outcome = guard
//!         .crud()
//!         .insert("readers", row([("full_name", SqlValue::from("Ada Byron"))]))
//!         .await?;
//!     println!("new reader id: {:?}", outcome.id);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod constraints;
pub mod core;
pub mod crud;
pub mod ddl;
pub mod drivers;
pub mod error;
pub mod events;
pub mod guard;
pub mod joins;
pub mod validate;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use catalog::{CatalogSnapshot, SchemaCatalog};
pub use config::{Config, DatabaseConfig, GuardConfig, IdStrategy};
pub use core::{row, ColumnDescriptor, ColumnKind, Record, RowMap, SqlValue, TableDescriptor};
pub use crud::{CrudExecutor, InsertOutcome, JoinRequest, SelectOptions};
pub use ddl::{
    AddColumnOutcome, ColumnConstraints, ColumnSpec, ConstraintToggles, SchemaMutator, TargetType,
};
pub use error::{ErrorKind, GuardError, Result};
pub use events::{Event, EventLevel, EventSink, MemorySink, TracingSink};
pub use guard::Guard;
pub use joins::{JoinEdge, JoinMapper};
pub use validate::{ValidationMode, Validator, Violation, ViolationKind};
