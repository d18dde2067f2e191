//! Guarded, parameterized CRUD and join execution.
//!
//! Every statement is built from catalog descriptors: identifiers are
//! quoted, values are bound. Rows are validated before any SQL is issued;
//! a validation failure never reaches the store.

pub mod ids;
pub mod query;

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::catalog::{CatalogSnapshot, SchemaCatalog};
use crate::config::GuardConfig;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::schema::{ColumnDescriptor, TableDescriptor};
use crate::core::traits::Store;
use crate::core::value::{Record, RowMap, SqlValue};
use crate::error::{GuardError, Result};
use crate::events::{Event, EventSink};
use crate::validate::{is_generated_key, ValidationMode, Validator, Violation, ViolationKind};

pub use ids::{smallest_free_id, IdAllocator};
use query::{column_ref, equality, order_clause, projection, where_clause, ParamList};

/// Result of an insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertOutcome {
    /// Key of the new row when the table has a single integer primary key.
    pub id: Option<i64>,
    pub row_count: u64,
}

/// Options of a single-table select.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Columns to return; all columns when empty.
    pub columns: Vec<String>,
    /// Equality conditions, AND-ed.
    pub condition: RowMap,
    /// `(column, ascending)` pairs.
    pub order_by: Vec<(String, bool)>,
    pub group_by: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// A two-table inner join.
///
/// Column names in `columns`, `condition` and `order_by` may be qualified
/// (`books.title`) or bare; a bare name resolves against the left table
/// first.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    pub left: String,
    pub right: String,
    /// Explicit `(left column, right column)` join keys.
    pub keys: Vec<(String, String)>,
    /// Output columns; every column of both tables when empty.
    pub columns: Vec<String>,
    pub condition: RowMap,
    pub order_by: Vec<(String, bool)>,
}

/// Executes validated DML against the store.
pub struct CrudExecutor {
    store: Arc<dyn Store>,
    catalog: Arc<SchemaCatalog>,
    validator: Validator,
    ids: IdAllocator,
    precheck_foreign_keys: bool,
    events: Arc<dyn EventSink>,
}

impl CrudExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<SchemaCatalog>,
        config: &GuardConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            ids: IdAllocator::new(store.clone(), config.id_strategy, events.clone()),
            store,
            catalog,
            validator: Validator::new(),
            precheck_foreign_keys: config.precheck_foreign_keys,
            events,
        }
    }

    pub fn id_allocator(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Validate and insert one row.
    ///
    /// A single integer primary key that is absent (and not identity-backed)
    /// is filled by the [`IdAllocator`]. Absent columns with a declared
    /// default are written as `DEFAULT`.
    pub async fn insert(&self, table: &str, row: RowMap) -> Result<InsertOutcome> {
        self.attempt("insert", table);
        let t = self.catalog.get_table(table)?;

        let violations = self.validator.validate(&t, &row, ValidationMode::Insert);
        if !violations.is_empty() {
            return Err(self.rejected("insert", &t.name, violations));
        }

        let mut row = row;
        row.retain(|name, value| {
            !(value.is_null() && t.column(name).is_some_and(|c| is_generated_key(&t, c)))
        });

        if self.precheck_foreign_keys {
            let missing = self.missing_references(&t, &row).await?;
            if !missing.is_empty() {
                return Err(self.rejected("insert", &t.name, missing));
            }
        }

        let mut allocated = None;
        if let Some(pk) = t.single_integer_pk() {
            if !pk.is_autoincrement && !row.contains_key(&pk.name) {
                let id = self.ids.find_free_id(&t).await?;
                row.insert(pk.name.clone(), SqlValue::Int(id));
                allocated = Some(id);
            }
        }

        let mut params = ParamList::new();
        let mut names = Vec::new();
        let mut values = Vec::new();
        for column in &t.columns {
            match row.remove(&column.name) {
                Some(value) => {
                    names.push(quote_pg(&column.name)?);
                    values.push(params.bind_for(value, column));
                }
                None if column.has_default() => {
                    names.push(quote_pg(&column.name)?);
                    values.push("DEFAULT".to_string());
                }
                None => {}
            }
        }

        let qualified = qualify_pg(&t.schema, &t.name)?;
        let mut sql = if names.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", qualified)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                qualified,
                names.join(", "),
                values.join(", ")
            )
        };

        let params = params.into_values();
        let outcome = if t.primary_key.is_empty() {
            let row_count = self.run("insert", &t.name, self.store.execute(&sql, &params)).await?;
            InsertOutcome { id: None, row_count }
        } else {
            let returning = t
                .primary_key
                .iter()
                .map(|c| quote_pg(c))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" RETURNING {}", returning.join(", ")));
            let rows = self.run("insert", &t.name, self.store.query(&sql, &params)).await?;
            let id = t
                .single_integer_pk()
                .and_then(|pk| rows.first().and_then(|r| r.get_i64(&pk.name)))
                .or(allocated);
            InsertOutcome {
                id,
                row_count: rows.len() as u64,
            }
        };

        let message = match outcome.id {
            Some(id) => format!("inserted {} row (id {})", outcome.row_count, id),
            None => format!("inserted {} row", outcome.row_count),
        };
        self.events.record(Event::info("insert", message).table(&t.name));
        Ok(outcome)
    }

    /// Update rows matching `condition`, returning the number changed.
    ///
    /// Columns of `row` or `condition` the table does not have are dropped
    /// with a warning; at least one known condition column must remain.
    pub async fn update(&self, table: &str, condition: &RowMap, row: RowMap) -> Result<u64> {
        self.attempt("update", table);
        let t = self.catalog.get_table(table)?;

        let (known, unknown): (RowMap, RowMap) =
            row.into_iter().partition(|(name, _)| t.has_column(name));
        if !unknown.is_empty() {
            let names: Vec<&str> = unknown.keys().map(String::as_str).collect();
            self.events.record(
                Event::warn("update", format!("ignoring unknown columns: {}", names.join(", ")))
                    .table(&t.name),
            );
        }
        if known.is_empty() {
            return Err(GuardError::schema(format!(
                "update of '{}' has no columns to set",
                t.name
            )));
        }

        let violations = self.validator.validate(&t, &known, ValidationMode::Update);
        if !violations.is_empty() {
            return Err(self.rejected("update", &t.name, violations));
        }

        let mut params = ParamList::new();
        let mut assignments = Vec::with_capacity(known.len());
        for (name, value) in known {
            let column = column_of(&t, &name)?;
            assignments.push(format!(
                "{} = {}",
                quote_pg(&column.name)?,
                params.bind_for(value, column)
            ));
        }
        let condition = self.known_condition("update", &t, condition);
        let predicates = required_predicates(&t, &condition, &mut params, "update")?;

        let sql = format!(
            "UPDATE {} SET {}{}",
            qualify_pg(&t.schema, &t.name)?,
            assignments.join(", "),
            where_clause(&predicates)
        );
        let count = self
            .run("update", &t.name, self.store.execute(&sql, &params.into_values()))
            .await?;
        self.events
            .record(Event::info("update", format!("updated {} rows", count)).table(&t.name));
        Ok(count)
    }

    /// Delete rows matching `condition`. Matching nothing is not an error.
    ///
    /// Unknown condition columns are dropped with a warning, as in
    /// [`update`](Self::update).
    pub async fn delete(&self, table: &str, condition: &RowMap) -> Result<u64> {
        self.attempt("delete", table);
        let t = self.catalog.get_table(table)?;
        let condition = self.known_condition("delete", &t, condition);
        let mut params = ParamList::new();
        let predicates = required_predicates(&t, &condition, &mut params, "delete")?;

        let sql = format!(
            "DELETE FROM {}{}",
            qualify_pg(&t.schema, &t.name)?,
            where_clause(&predicates)
        );
        let count = self
            .run("delete", &t.name, self.store.execute(&sql, &params.into_values()))
            .await?;
        self.events
            .record(Event::info("delete", format!("deleted {} rows", count)).table(&t.name));
        Ok(count)
    }

    /// Single-table select.
    pub async fn select(&self, table: &str, options: &SelectOptions) -> Result<Vec<Record>> {
        self.attempt("select", table);
        let t = self.catalog.get_table(table)?;

        let selected: Vec<&ColumnDescriptor> = if !options.columns.is_empty() {
            options
                .columns
                .iter()
                .map(|c| column_of(&t, c))
                .collect::<Result<_>>()?
        } else if !options.group_by.is_empty() {
            options
                .group_by
                .iter()
                .map(|c| column_of(&t, c))
                .collect::<Result<_>>()?
        } else {
            t.columns.iter().collect()
        };
        let select_list = selected
            .iter()
            .map(|c| projection(None, c, None))
            .collect::<Result<Vec<_>>>()?;

        let mut params = ParamList::new();
        let predicates = predicates(&t, &options.condition, &mut params)?;

        let mut sql = format!(
            "SELECT {} FROM {}{}",
            select_list.join(", "),
            qualify_pg(&t.schema, &t.name)?,
            where_clause(&predicates)
        );
        if !options.group_by.is_empty() {
            let groups = options
                .group_by
                .iter()
                .map(|c| column_of(&t, c).and_then(|col| quote_pg(&col.name)))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }
        let order = options
            .order_by
            .iter()
            .map(|(c, asc)| Ok((quote_pg(&column_of(&t, c)?.name)?, *asc)))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&order_clause(&order));
        if let Some(limit) = options.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = options.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        debug!("select on {}: {}", t.name, sql);
        let rows = self
            .run("select", &t.name, self.store.query(&sql, &params.into_values()))
            .await?;
        self.events.record(
            Event::debug("select", format!("returned {} rows", rows.len())).table(&t.name),
        );
        Ok(rows)
    }

    /// Number of rows matching `condition` (all rows when empty).
    pub async fn count(&self, table: &str, condition: &RowMap) -> Result<i64> {
        self.attempt("count", table);
        let t = self.catalog.get_table(table)?;
        let mut params = ParamList::new();
        let predicates = predicates(&t, condition, &mut params)?;
        let sql = format!(
            "SELECT COUNT(*)::int8 AS row_count FROM {}{}",
            qualify_pg(&t.schema, &t.name)?,
            where_clause(&predicates)
        );
        let row = self
            .run("count", &t.name, self.store.query_opt(&sql, &params.into_values()))
            .await?;
        let count = row.and_then(|r| r.get_i64("row_count")).unwrap_or(0);
        self.events
            .record(Event::debug("count", format!("counted {} rows", count)).table(&t.name));
        Ok(count)
    }

    /// Whether any row matches `condition`.
    pub async fn exists(&self, table: &str, condition: &RowMap) -> Result<bool> {
        self.attempt("exists", table);
        let t = self.catalog.get_table(table)?;
        let mut params = ParamList::new();
        let predicates = predicates(&t, condition, &mut params)?;
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {}{}) AS found",
            qualify_pg(&t.schema, &t.name)?,
            where_clause(&predicates)
        );
        let row = self
            .run("exists", &t.name, self.store.query_opt(&sql, &params.into_values()))
            .await?;
        let found = row.and_then(|r| r.get_bool("found")).unwrap_or(false);
        self.events.record(
            Event::debug("exists", if found { "match found" } else { "no match" }).table(&t.name),
        );
        Ok(found)
    }

    /// Inner join of two tables.
    ///
    /// Join keys are the explicit `keys` if given, otherwise the foreign
    /// key linking the tables, otherwise the first column name they share.
    /// Output columns are named `table.column`.
    pub async fn join(&self, request: &JoinRequest) -> Result<Vec<Record>> {
        self.attempt("join", &format!("{}+{}", request.left, request.right));
        let snapshot = self.catalog.snapshot();
        let left = snapshot.table(&request.left)?;
        let right = snapshot.table(&request.right)?;
        if left.name == right.name {
            return Err(GuardError::schema(format!(
                "cannot join '{}' with itself",
                left.name
            )));
        }
        let scope = JoinScope {
            left: left.as_ref(),
            right: right.as_ref(),
        };

        let keys = join_keys(&snapshot, &scope, &request.keys)?;
        let on = keys
            .iter()
            .map(|(a, b)| {
                Ok(format!(
                    "{} = {}",
                    column_ref(Some(&left.name), a)?,
                    column_ref(Some(&right.name), b)?
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let outputs: Vec<(&TableDescriptor, &ColumnDescriptor)> = if request.columns.is_empty() {
            left.columns
                .iter()
                .map(|c| (left.as_ref(), c))
                .chain(right.columns.iter().map(|c| (right.as_ref(), c)))
                .collect()
        } else {
            request
                .columns
                .iter()
                .map(|c| scope.resolve(c))
                .collect::<Result<_>>()?
        };
        let select_list = outputs
            .iter()
            .map(|(t, c)| {
                let alias = format!("{}.{}", t.name, c.name);
                projection(Some(&t.name), c, Some(&alias))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut params = ParamList::new();
        let mut conditions = Vec::with_capacity(request.condition.len());
        for (name, value) in &request.condition {
            let (t, c) = scope.resolve(name)?;
            conditions.push(equality(Some(&t.name), c, value.clone(), &mut params)?);
        }
        let order = request
            .order_by
            .iter()
            .map(|(name, asc)| {
                let (t, c) = scope.resolve(name)?;
                Ok((column_ref(Some(&t.name), &c.name)?, *asc))
            })
            .collect::<Result<Vec<_>>>()?;

        let sql = format!(
            "SELECT {} FROM {} JOIN {} ON {}{}{}",
            select_list.join(", "),
            qualify_pg(&left.schema, &left.name)?,
            qualify_pg(&right.schema, &right.name)?,
            on.join(" AND "),
            where_clause(&conditions),
            order_clause(&order)
        );

        let label = format!("{}+{}", left.name, right.name);
        let rows = self
            .run("join", &label, self.store.query(&sql, &params.into_values()))
            .await?;
        self.events
            .record(Event::debug("join", format!("returned {} rows", rows.len())).table(label));
        Ok(rows)
    }

    /// Foreign keys whose referenced row does not exist, as violations.
    async fn missing_references(&self, t: &TableDescriptor, row: &RowMap) -> Result<Vec<Violation>> {
        let mut missing = Vec::new();
        for fk in &t.foreign_keys {
            let values: Option<Vec<&SqlValue>> = fk
                .columns
                .iter()
                .map(|c| row.get(c).filter(|v| !v.is_null()))
                .collect();
            let Some(values) = values else {
                continue;
            };

            let mut params = ParamList::new();
            let mut predicates = Vec::with_capacity(values.len());
            for ((column, ref_column), value) in fk.columns.iter().zip(&fk.ref_columns).zip(values) {
                let descriptor = column_of(t, column)?;
                predicates.push(format!(
                    "{} = {}",
                    quote_pg(ref_column)?,
                    params.bind_match(value.clone(), descriptor)
                ));
            }
            let sql = format!(
                "SELECT EXISTS (SELECT 1 FROM {}{}) AS found",
                qualify_pg(&fk.ref_schema, &fk.ref_table)?,
                where_clause(&predicates)
            );
            let found = self
                .run("insert", &t.name, self.store.query_opt(&sql, &params.into_values()))
                .await?
                .and_then(|r| r.get_bool("found"))
                .unwrap_or(false);
            if !found {
                missing.push(Violation::new(
                    fk.columns.join(", "),
                    ViolationKind::ForeignKey,
                    format!(
                        "no row in '{}' with {} matching",
                        fk.ref_table,
                        fk.ref_columns.join(", ")
                    ),
                ));
            }
        }
        Ok(missing)
    }

    fn attempt(&self, operation: &str, table: &str) {
        self.events
            .record(Event::debug(operation, "attempting").table(table));
    }

    /// The part of `condition` naming columns of `t`; the rest is reported
    /// as a warning and dropped.
    fn known_condition(&self, operation: &str, t: &TableDescriptor, condition: &RowMap) -> RowMap {
        let (known, unknown): (RowMap, RowMap) = condition
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .partition(|(name, _)| t.has_column(name));
        if !unknown.is_empty() {
            let names: Vec<&str> = unknown.keys().map(String::as_str).collect();
            self.events.record(
                Event::warn(
                    operation,
                    format!("ignoring unknown condition columns: {}", names.join(", ")),
                )
                .table(&t.name),
            );
        }
        known
    }

    fn rejected(&self, operation: &str, table: &str, violations: Vec<Violation>) -> GuardError {
        self.events.record(
            Event::warn(
                operation,
                format!("rejected before execution: {} violations", violations.len()),
            )
            .table(table),
        );
        GuardError::validation(table, violations)
    }

    /// Await a store call, recording failures as error events.
    async fn run<T>(
        &self,
        operation: &str,
        table: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match call.await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.events
                    .record(Event::error(operation, e.to_string()).table(table));
                Err(e)
            }
        }
    }
}

fn column_of<'t>(table: &'t TableDescriptor, name: &str) -> Result<&'t ColumnDescriptor> {
    table.column(name).ok_or_else(|| {
        GuardError::schema(format!("table '{}' has no column '{}'", table.name, name))
    })
}

fn predicates(table: &TableDescriptor, condition: &RowMap, params: &mut ParamList) -> Result<Vec<String>> {
    condition
        .iter()
        .map(|(name, value)| equality(None, column_of(table, name)?, value.clone(), params))
        .collect()
}

/// Predicates for UPDATE/DELETE, which never run without a WHERE clause.
///
/// `condition` holds only known columns; an empty one is refused.
fn required_predicates(
    table: &TableDescriptor,
    condition: &RowMap,
    params: &mut ParamList,
    operation: &str,
) -> Result<Vec<String>> {
    if condition.is_empty() {
        return Err(GuardError::schema(format!(
            "{} on '{}' requires a condition on at least one of its columns",
            operation, table.name
        )));
    }
    predicates(table, condition, params)
}

struct JoinScope<'a> {
    left: &'a TableDescriptor,
    right: &'a TableDescriptor,
}

impl<'a> JoinScope<'a> {
    /// Resolve `table.column` or a bare column name (left table first).
    fn resolve(&self, name: &str) -> Result<(&'a TableDescriptor, &'a ColumnDescriptor)> {
        if let Some((table, column)) = name.split_once('.') {
            let t = [self.left, self.right]
                .into_iter()
                .find(|t| t.name == table)
                .ok_or_else(|| {
                    GuardError::schema(format!("'{}' is not part of this join", table))
                })?;
            return Ok((t, column_of(t, column)?));
        }
        [self.left, self.right]
            .into_iter()
            .find_map(|t| t.column(name).map(|c| (t, c)))
            .ok_or_else(|| {
                GuardError::schema(format!(
                    "neither '{}' nor '{}' has column '{}'",
                    self.left.name, self.right.name, name
                ))
            })
    }
}

fn join_keys(
    snapshot: &CatalogSnapshot,
    scope: &JoinScope<'_>,
    explicit: &[(String, String)],
) -> Result<Vec<(String, String)>> {
    let (left, right) = (scope.left, scope.right);
    if !explicit.is_empty() {
        for (a, b) in explicit {
            column_of(left, a)?;
            column_of(right, b)?;
        }
        return Ok(explicit.to_vec());
    }
    if let Some((a, b)) = snapshot.joins().get(&left.name, &right.name) {
        return Ok(vec![(a.to_string(), b.to_string())]);
    }
    left.columns
        .iter()
        .find(|c| right.has_column(&c.name))
        .map(|c| vec![(c.name.clone(), c.name.clone())])
        .ok_or_else(|| {
            GuardError::schema(format!(
                "no join path between '{}' and '{}'",
                left.name, right.name
            ))
        })
}
