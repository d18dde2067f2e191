//! Core traits separating the guarded layer from the database driver.
//!
//! - [`Store`]: executes parameterized statements on the single session
//! - [`SchemaReader`]: reflects live structure into table descriptors
//!
//! Components depend on `Arc<dyn Store>` so tests can substitute an
//! in-memory store and the PostgreSQL driver stays in `drivers::postgres`.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;

use super::schema::TableDescriptor;
use super::value::{Record, SqlValue};

/// Statement execution against the underlying store.
///
/// Implementations classify driver errors into the crate's error kinds
/// (connectivity vs. constraint violation vs. other statement failures).
#[async_trait]
pub trait Store: Send + Sync {
    /// Run a statement returning rows.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Record>>;

    /// Run a statement returning the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a statement expected to return at most one row.
    async fn query_opt(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Record>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Verify the store is reachable.
    async fn ping(&self) -> Result<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }
}

/// Reflect live schema structure.
#[async_trait]
pub trait SchemaReader: Send + Sync {
    /// Extract every base table of `schema` with columns, keys, indexes and
    /// CHECK constraints. Interpreted rules are filled in by the catalog.
    async fn extract_schema(&self, schema: &str) -> Result<Vec<TableDescriptor>>;

    /// Enum types visible from `schema`, with labels in declaration order.
    async fn extract_enums(&self, schema: &str) -> Result<BTreeMap<String, Vec<String>>>;
}
