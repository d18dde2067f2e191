//! Integer primary key allocation for inserts that omit the key.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::config::IdStrategy;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::schema::TableDescriptor;
use crate::core::traits::Store;
use crate::core::value::SqlValue;
use crate::error::{GuardError, Result};
use crate::events::{Event, EventSink};

/// Chooses the next id for a single-integer-key table.
pub struct IdAllocator {
    store: Arc<dyn Store>,
    strategy: IdStrategy,
    events: Arc<dyn EventSink>,
}

impl IdAllocator {
    pub fn new(store: Arc<dyn Store>, strategy: IdStrategy, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            strategy,
            events,
        }
    }

    pub fn strategy(&self) -> IdStrategy {
        self.strategy
    }

    /// Next id for `table`.
    ///
    /// With [`IdStrategy::GapFill`] this is the smallest integer in
    /// `[1, max+1]` not in use, falling back to `max+1` if the gap scan
    /// fails. An empty table, or one holding only keys below 1, yields 1.
    pub async fn find_free_id(&self, table: &TableDescriptor) -> Result<i64> {
        let pk = table.single_integer_pk().ok_or_else(|| {
            GuardError::schema(format!(
                "table '{}' has no single integer primary key",
                table.name
            ))
        })?;
        let qualified = qualify_pg(&table.schema, &table.name)?;
        let pk_col = quote_pg(&pk.name)?;

        let max_sql = format!("SELECT MAX({})::int8 AS max_id FROM {}", pk_col, qualified);
        let max = self
            .store
            .query_opt(&max_sql, &[])
            .await?
            .and_then(|r| r.get_i64("max_id"));
        let Some(max) = max else {
            return Ok(1);
        };
        let next = max.checked_add(1).ok_or_else(|| {
            GuardError::integrity_risk(&table.name, &pk.name, "primary key space exhausted")
        })?
        .max(1);

        if self.strategy == IdStrategy::Monotonic {
            return Ok(next);
        }

        let gap_sql = format!(
            "SELECT MIN(s.id) AS id FROM generate_series(1, $1::int8) AS s(id) \
             LEFT JOIN {} AS t ON t.{} = s.id WHERE t.{} IS NULL",
            qualified, pk_col, pk_col
        );
        match self.store.query_opt(&gap_sql, &[SqlValue::Int(next)]).await {
            Ok(row) => {
                let id = row.and_then(|r| r.get_i64("id")).unwrap_or(next);
                debug!("free id for {}: {} (max {})", table.name, id, max);
                Ok(id)
            }
            Err(e) => {
                self.events.record(
                    Event::warn(
                        "find_free_id",
                        format!("gap scan failed, using max+1 ({}): {}", next, e),
                    )
                    .table(&table.name),
                );
                Ok(next)
            }
        }
    }
}

/// Smallest positive integer not in `ids`.
///
/// Equivalent to the gap scan: the result always lies in `[1, max+1]`.
pub fn smallest_free_id(ids: &[i64]) -> i64 {
    let used: BTreeSet<i64> = ids.iter().copied().filter(|id| *id > 0).collect();
    let mut candidate = 1;
    for id in used {
        if id != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}
