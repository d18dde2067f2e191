//! PostgreSQL driver.
//!
//! - [`PgStore`]: the single guarded session, implementing `Store` and `SchemaReader`
//! - [`errors`]: SQLSTATE classification into the crate's error kinds

pub mod errors;
mod reflect;
mod store;

pub use reflect::{reflect_enums, reflect_schema};
pub use store::PgStore;
