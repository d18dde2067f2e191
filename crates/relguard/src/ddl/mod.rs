//! Phased, dependency-aware schema changes.
//!
//! Each structural change is split into phases, one statement (or one
//! check plus statement) each, with no enclosing transaction. Checks that
//! would make a phase fail on existing data (NULLs before `SET NOT NULL`,
//! duplicates before `UNIQUE`) run first and refuse with
//! [`GuardError::IntegrityRisk`] instead of letting the server error out
//! halfway through.
//!
//! Operations are serialized under one async mutex, every phase is written
//! to the [`DdlJournal`], and the catalog is refreshed after each
//! successful operation. A failed operation leaves the catalog untouched.

pub mod journal;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::catalog::{CatalogSnapshot, SchemaCatalog};
use crate::constraints::mentions_column;
use crate::core::identifier::{
    qualify_pg, quote_literal, quote_pg, validate_check_constraint, validate_identifier,
    validate_type_name,
};
use crate::core::kind::ColumnKind;
use crate::core::schema::{ColumnDescriptor, TableDescriptor};
use crate::core::traits::Store;
use crate::core::value::{Record, SqlValue};
use crate::error::{GuardError, Result};
use crate::events::{Event, EventSink};

pub use journal::{DdlEntry, DdlJournal, OperationStatus, PhaseRecord, PhaseStatus};

const PHASE_ADD_COLUMN: &str = "add_column";
const PHASE_BACKFILL: &str = "backfill_default";
const PHASE_ADD_CHECK: &str = "add_check";
const PHASE_SET_NOT_NULL: &str = "set_not_null";
const PHASE_ADD_UNIQUE: &str = "add_unique";
const PHASE_ADD_PK: &str = "add_primary_key";
const PHASE_ADD_IDENTITY: &str = "add_identity";
const PHASE_ADD_FK: &str = "add_foreign_key";
const PHASE_VALIDATE_FK: &str = "validate_foreign_key";

/// PostgreSQL truncates identifiers beyond 63 bytes.
const MAX_NAME_LEN: usize = 63;

/// Constraints requested for a new column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConstraints {
    pub unique: bool,
    pub nullable: bool,
    /// Literal default, also used to backfill existing rows.
    pub default: Option<SqlValue>,
    /// CHECK expression.
    pub check: Option<String>,
    /// Referenced column as `table.column`.
    pub foreign_key: Option<String>,
    pub primary_key: bool,
    /// Identity column; only valid on an integer primary key.
    pub autoincrement: bool,
}

impl Default for ColumnConstraints {
    fn default() -> Self {
        Self {
            unique: false,
            nullable: true,
            default: None,
            check: None,
            foreign_key: None,
            primary_key: false,
            autoincrement: false,
        }
    }
}

/// A column of a table to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
    #[serde(flatten)]
    pub constraints: ColumnConstraints,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            constraints: ColumnConstraints::default(),
        }
    }

    pub fn with(mut self, constraints: ColumnConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Independent changes to an existing column. `None` leaves a property alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintToggles {
    pub nullable: Option<bool>,
    /// `Some(None)` drops the default.
    pub default: Option<Option<SqlValue>>,
    pub check: Option<String>,
}

/// Target of a column type change.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetType {
    /// A type name such as `bigint` or `varchar(40)`.
    Sql(String),
    /// A new enum type `<table>_<column>_enum` over the column's distinct values.
    AutoEnum,
}

/// Result of [`SchemaMutator::add_column`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AddColumnOutcome {
    pub phases_applied: Vec<String>,
    /// Non-fatal problems, e.g. a foreign key left `NOT VALID`.
    pub warnings: Vec<String>,
}

/// Applies structural changes and keeps the catalog in step.
pub struct SchemaMutator {
    store: Arc<dyn Store>,
    catalog: Arc<SchemaCatalog>,
    journal: Mutex<DdlJournal>,
    events: Arc<dyn EventSink>,
}

impl SchemaMutator {
    pub fn new(
        store: Arc<dyn Store>,
        catalog: Arc<SchemaCatalog>,
        journal: DdlJournal,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            catalog,
            journal: Mutex::new(journal),
            events,
        }
    }

    /// Operations a previous process started but never finished.
    pub async fn pending(&self) -> Vec<DdlEntry> {
        self.journal.lock().await.pending()
    }

    /// Mark interrupted operations as handled.
    pub async fn acknowledge_pending(&self) -> Result<usize> {
        self.journal.lock().await.acknowledge_pending()
    }

    /// Re-read the catalog once no structural change is in flight.
    pub async fn refresh_catalog(&self) -> Result<Arc<CatalogSnapshot>> {
        let _journal = self.journal.lock().await;
        self.catalog.refresh().await
    }

    /// Add a column in phases.
    ///
    /// 1. add the column nullable (with its default)
    /// 2. backfill NULLs with the default
    /// 3. add the CHECK constraint
    /// 4. `SET NOT NULL` (unless nullable or primary key)
    /// 5. add `UNIQUE` after a duplicate scan
    /// 6. add the primary key, numbering NULL rows of an integer column first
    /// 7. make an integer primary key an identity column
    /// 8. add the foreign key `NOT VALID`, then validate it
    ///
    /// A failed validation in phase 8 is reported as a warning; any other
    /// failure aborts with the phase name attached.
    pub async fn add_column(
        &self,
        table: &str,
        name: &str,
        sql_type: &str,
        constraints: &ColumnConstraints,
    ) -> Result<AddColumnOutcome> {
        self.reported("add_column", table, async {
            let journal = self.journal.lock().await;
            let snapshot = self.catalog.snapshot();
            let t = Arc::clone(snapshot.table(table)?);

            validate_identifier(name)?;
            validate_type_name(sql_type)?;
            if t.has_column(name) {
                return Err(GuardError::schema(format!(
                    "column '{}' already exists in '{}'",
                    name, t.name
                )));
            }
            if constraints.primary_key && t.has_pk() {
                return Err(GuardError::schema(format!(
                    "table '{}' already has a primary key ({})",
                    t.name,
                    t.primary_key.join(", ")
                )));
            }
            if constraints.autoincrement && !(constraints.primary_key && is_integer_type(sql_type)) {
                return Err(GuardError::schema(
                    "autoincrement requires an integer primary key column",
                ));
            }
            if constraints.autoincrement && constraints.default.is_some() {
                return Err(GuardError::schema(
                    "an autoincrement column cannot have a default",
                ));
            }
            let default = constraints.default.as_ref().map(quote_literal).transpose()?;
            if let Some(check) = &constraints.check {
                validate_check_constraint(check)?;
            }
            let reference = match &constraints.foreign_key {
                Some(spec) => {
                    let (ref_table, ref_column) = parse_reference(spec)?;
                    check_reference(&snapshot, ref_table, ref_column)?;
                    Some((ref_table.to_string(), ref_column.to_string()))
                }
                None => None,
            };

            let mut op = Operation::begin(self.store.as_ref(), journal, "add_column", &t.name, Some(name))?;
            let plan = AddColumnPlan {
                table: &t,
                name,
                sql_type,
                constraints,
                default: default.as_deref(),
                reference,
            };
            let result = plan.run(&mut op).await;
            self.complete(op, result).await
        })
        .await
    }

    /// Drop a column, returning the dependent objects that went with it.
    ///
    /// Dependents are foreign keys using or referencing the column, CHECK
    /// constraints mentioning it and indexes covering it. Without `force`
    /// any dependent blocks the drop.
    pub async fn drop_column(&self, table: &str, column: &str, force: bool) -> Result<Vec<String>> {
        self.reported("drop_column", table, async {
            let journal = self.journal.lock().await;
            let snapshot = self.catalog.snapshot();
            let t = Arc::clone(snapshot.table(table)?);
            column_of(&t, column)?;

            let dependents = column_dependents(&snapshot, &t, column);
            if !dependents.is_empty() && !force {
                return Err(GuardError::Dependency {
                    table: t.name.clone(),
                    column: column.to_string(),
                    dependents,
                });
            }

            let sql = format!(
                "ALTER TABLE {} DROP COLUMN {}{}",
                qualify_pg(&t.schema, &t.name)?,
                quote_pg(column)?,
                if force { " CASCADE" } else { "" }
            );
            let mut op = Operation::begin(self.store.as_ref(), journal, "drop_column", &t.name, Some(column))?;
            let result = op.phase("drop_column", &[sql]).await.map(|_| dependents);
            self.complete(op, result).await
        })
        .await
    }

    pub async fn rename_table(&self, old: &str, new: &str) -> Result<()> {
        self.reported("rename_table", old, async {
            let journal = self.journal.lock().await;
            let snapshot = self.catalog.snapshot();
            let t = Arc::clone(snapshot.table(old)?);
            validate_identifier(new)?;
            if snapshot.contains_table(new) {
                return Err(GuardError::schema(format!("table '{}' already exists", new)));
            }

            let sql = format!(
                "ALTER TABLE {} RENAME TO {}",
                qualify_pg(&t.schema, &t.name)?,
                quote_pg(new)?
            );
            let mut op = Operation::begin(self.store.as_ref(), journal, "rename_table", &t.name, None)?;
            let result = op.phase("rename_table", &[sql]).await;
            self.complete(op, result).await
        })
        .await
    }

    /// Rename a column, returning how many dependent objects follow it.
    ///
    /// The server rewrites dependents itself, so they never block a rename.
    pub async fn rename_column(&self, table: &str, old: &str, new: &str) -> Result<usize> {
        self.reported("rename_column", table, async {
            let journal = self.journal.lock().await;
            let snapshot = self.catalog.snapshot();
            let t = Arc::clone(snapshot.table(table)?);
            column_of(&t, old)?;
            validate_identifier(new)?;
            if t.has_column(new) {
                return Err(GuardError::schema(format!(
                    "column '{}' already exists in '{}'",
                    new, t.name
                )));
            }

            let dependents = column_dependents(&snapshot, &t, old).len();
            let sql = format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                qualify_pg(&t.schema, &t.name)?,
                quote_pg(old)?,
                quote_pg(new)?
            );
            let mut op = Operation::begin(self.store.as_ref(), journal, "rename_column", &t.name, Some(old))?;
            let result = op.phase("rename_column", &[sql]).await.map(|_| dependents);
            if dependents > 0 && result.is_ok() {
                self.events.record(
                    Event::info(
                        "rename_column",
                        format!("{} dependent objects now refer to '{}'", dependents, new),
                    )
                    .table(&t.name),
                );
            }
            self.complete(op, result).await
        })
        .await
    }

    /// Change a column's type.
    ///
    /// Primary and foreign key columns are refused. Without `using`, a cast
    /// is inferred from the current and target kinds. `using` is ignored
    /// for [`TargetType::AutoEnum`].
    pub async fn alter_column_type(
        &self,
        table: &str,
        column: &str,
        target: &TargetType,
        using: Option<&str>,
    ) -> Result<()> {
        self.reported("alter_column_type", table, async {
            let journal = self.journal.lock().await;
            let snapshot = self.catalog.snapshot();
            let t = Arc::clone(snapshot.table(table)?);
            let col = column_of(&t, column)?.clone();

            if col.is_primary_key
                || t.is_fk_column(column)
                || !snapshot.referencing(&t.name, Some(column)).is_empty()
            {
                return Err(GuardError::integrity_risk(
                    &t.name,
                    column,
                    "key columns cannot change type",
                ));
            }

            let q_table = qualify_pg(&t.schema, &t.name)?;
            let q_col = quote_pg(column)?;
            match target {
                TargetType::Sql(sql_type) => {
                    validate_type_name(sql_type)?;
                    let expr = match using {
                        Some(expr) => {
                            validate_check_constraint(expr)?;
                            expr.to_string()
                        }
                        None => infer_cast(&col, sql_type)?,
                    };
                    let sql = format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}",
                        q_table, q_col, sql_type, expr
                    );
                    let to_boolean = using.is_none()
                        && matches!(col.kind, ColumnKind::String)
                        && type_family(sql_type) == TypeFamily::Boolean;
                    let mut op =
                        Operation::begin(self.store.as_ref(), journal, "alter_column_type", &t.name, Some(column))?;
                    let result = async {
                        if to_boolean {
                            op.start("check_values")?;
                            if op.found(&unreadable_boolean_sql(&q_table, &q_col)).await? {
                                return Err(op.fail(GuardError::integrity_risk(
                                    &t.name,
                                    column,
                                    "existing values cannot be read as booleans",
                                )));
                            }
                            op.done()?;
                        }
                        op.phase("alter_type", &[sql]).await
                    }
                    .await;
                    self.complete(op, result).await
                }
                TargetType::AutoEnum => {
                    let enum_name = derived_name(&t.name, column, "enum");
                    if snapshot.enum_values(&enum_name).is_some() {
                        return Err(GuardError::schema(format!(
                            "enum type '{}' already exists",
                            enum_name
                        )));
                    }
                    let q_enum = qualify_pg(&t.schema, &enum_name)?;

                    let mut op =
                        Operation::begin(self.store.as_ref(), journal, "alter_column_type", &t.name, Some(column))?;
                    let result = async {
                        op.start("collect_values")?;
                        let rows = op
                            .query(
                                &format!(
                                    "SELECT DISTINCT {}::text AS label FROM {} WHERE {} IS NOT NULL ORDER BY 1",
                                    q_col, q_table, q_col
                                ),
                                &[],
                            )
                            .await?;
                        op.done()?;
                        let labels: Vec<String> = rows
                            .iter()
                            .filter_map(|r| r.get_str("label").map(str::to_string))
                            .collect();

                        op.phase("create_enum", &[create_enum_sql(&q_enum, &labels)?])
                            .await?;
                        op.phase(
                            "alter_type",
                            &[format!(
                                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::text::{}",
                                q_table, q_col, q_enum, q_col, q_enum
                            )],
                        )
                        .await
                    }
                    .await;
                    self.complete(op, result).await
                }
            }
        })
        .await
    }

    /// Toggle nullability, the default and add a CHECK, each independently.
    ///
    /// Returns the phases applied.
    pub async fn alter_column_constraints(
        &self,
        table: &str,
        column: &str,
        toggles: &ConstraintToggles,
    ) -> Result<Vec<String>> {
        self.reported("alter_column_constraints", table, async {
            let journal = self.journal.lock().await;
            let snapshot = self.catalog.snapshot();
            let t = Arc::clone(snapshot.table(table)?);
            let col = column_of(&t, column)?.clone();

            if toggles == &ConstraintToggles::default() {
                return Ok(Vec::new());
            }
            if toggles.nullable == Some(true) && col.is_primary_key {
                return Err(GuardError::integrity_risk(
                    &t.name,
                    column,
                    "primary key columns cannot allow NULL",
                ));
            }
            let default = match &toggles.default {
                Some(Some(value)) => Some(Some(quote_literal(value)?)),
                Some(None) => Some(None),
                None => None,
            };
            if let Some(check) = &toggles.check {
                validate_check_constraint(check)?;
            }

            let q_table = qualify_pg(&t.schema, &t.name)?;
            let q_col = quote_pg(column)?;
            let mut op =
                Operation::begin(self.store.as_ref(), journal, "alter_column_constraints", &t.name, Some(column))?;
            let result = async {
                match &default {
                    Some(Some(literal)) => {
                        op.phase(
                            "set_default",
                            &[format!(
                                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                                q_table, q_col, literal
                            )],
                        )
                        .await?
                    }
                    Some(None) => {
                        op.phase(
                            "drop_default",
                            &[format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", q_table, q_col)],
                        )
                        .await?
                    }
                    None => {}
                }
                if let Some(check) = &toggles.check {
                    let existing: HashSet<&str> =
                        t.check_constraints.iter().map(|c| c.name.as_str()).collect();
                    let name = unused_name(&derived_name(&t.name, column, "check"), &existing);
                    op.phase(
                        PHASE_ADD_CHECK,
                        &[format!(
                            "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({})",
                            q_table,
                            quote_pg(&name)?,
                            check
                        )],
                    )
                    .await?;
                }
                match toggles.nullable {
                    Some(true) => {
                        op.phase(
                            "drop_not_null",
                            &[format!("ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL", q_table, q_col)],
                        )
                        .await?
                    }
                    Some(false) => set_not_null(&mut op, &t.name, column, &q_table, &q_col).await?,
                    None => {}
                }
                Ok::<_, GuardError>(op.applied.clone())
            }
            .await;
            self.complete(op, result).await
        })
        .await
    }

    /// Create a table. Primary key columns become one `PRIMARY KEY` constraint.
    pub async fn create_table(&self, name: &str, columns: &[ColumnSpec]) -> Result<()> {
        self.reported("create_table", name, async {
            let journal = self.journal.lock().await;
            let snapshot = self.catalog.snapshot();
            validate_identifier(name)?;
            if snapshot.contains_table(name) {
                return Err(GuardError::schema(format!("table '{}' already exists", name)));
            }
            if columns.is_empty() {
                return Err(GuardError::schema(format!("table '{}' needs at least one column", name)));
            }

            let mut seen = HashSet::new();
            let mut definitions = Vec::with_capacity(columns.len() + 1);
            let mut primary_key = Vec::new();
            for spec in columns {
                if !seen.insert(spec.name.as_str()) {
                    return Err(GuardError::schema(format!("duplicate column '{}'", spec.name)));
                }
                definitions.push(column_definition(&snapshot, name, columns, spec)?);
                if spec.constraints.primary_key {
                    primary_key.push(quote_pg(&spec.name)?);
                }
            }
            if !primary_key.is_empty() {
                definitions.push(format!("PRIMARY KEY ({})", primary_key.join(", ")));
            }

            let sql = format!(
                "CREATE TABLE {} ({})",
                qualify_pg(snapshot.schema(), name)?,
                definitions.join(", ")
            );
            let mut op = Operation::begin(self.store.as_ref(), journal, "create_table", name, None)?;
            let result = op.phase("create_table", &[sql]).await;
            self.complete(op, result).await
        })
        .await
    }

    /// Drop a table, returning the foreign keys that went with it.
    pub async fn drop_table(&self, name: &str, force: bool) -> Result<Vec<String>> {
        self.reported("drop_table", name, async {
            let journal = self.journal.lock().await;
            let snapshot = self.catalog.snapshot();
            let t = Arc::clone(snapshot.table(name)?);

            let dependents: Vec<String> = snapshot
                .referencing(&t.name, None)
                .into_iter()
                .map(|(child, fk)| format!("foreign key {}.{}", child, fk.name))
                .collect();
            if !dependents.is_empty() && !force {
                return Err(GuardError::Dependency {
                    table: t.name.clone(),
                    column: "*".to_string(),
                    dependents,
                });
            }

            let sql = format!(
                "DROP TABLE {}{}",
                qualify_pg(&t.schema, &t.name)?,
                if force { " CASCADE" } else { "" }
            );
            let mut op = Operation::begin(self.store.as_ref(), journal, "drop_table", &t.name, None)?;
            let result = op.phase("drop_table", &[sql]).await.map(|_| dependents);
            self.complete(op, result).await
        })
        .await
    }

    pub async fn create_enum(&self, name: &str, values: &[String]) -> Result<()> {
        self.reported("create_enum", name, async {
            let journal = self.journal.lock().await;
            let snapshot = self.catalog.snapshot();
            validate_identifier(name)?;
            if snapshot.enum_values(name).is_some() {
                return Err(GuardError::schema(format!("enum type '{}' already exists", name)));
            }
            let mut seen = HashSet::new();
            if let Some(dup) = values.iter().find(|v| !seen.insert(v.as_str())) {
                return Err(GuardError::schema(format!("duplicate enum label '{}'", dup)));
            }

            let sql = create_enum_sql(&qualify_pg(snapshot.schema(), name)?, values)?;
            let mut op = Operation::begin(self.store.as_ref(), journal, "create_enum", name, None)?;
            let result = op.phase("create_enum", &[sql]).await;
            self.complete(op, result).await
        })
        .await
    }

    /// Close the journal entry, then refresh the catalog on success.
    async fn complete<T>(&self, mut op: Operation<'_>, result: Result<T>) -> Result<T> {
        if let (Err(e), Some(phase)) = (&result, op.current.take()) {
            if let Err(j) = op.journal.phase_failed(op.id, &phase, &e.to_string()) {
                warn!("could not journal failed phase {}: {}", phase, j);
            }
        }
        let closed = op.journal.finish(op.id, result.is_ok());

        match result {
            Ok(value) => {
                closed?;
                self.events.record(
                    Event::info(op.name, format!("applied: {}", op.applied.join(", ")))
                        .table(&op.table),
                );
                self.catalog.refresh().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(j) = closed {
                    warn!("could not journal failed {}: {}", op.name, j);
                }
                Err(e)
            }
        }
    }

    /// Record the attempt of one operation, and its failure if it fails.
    async fn reported<T>(
        &self,
        operation: &'static str,
        table: &str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.events
            .record(Event::debug(operation, "attempting").table(table));
        match work.await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.events
                    .record(Event::error(operation, e.to_string()).table(table));
                Err(e)
            }
        }
    }
}

/// One journaled operation in progress; holds the DDL lock.
struct Operation<'a> {
    store: &'a dyn Store,
    journal: MutexGuard<'a, DdlJournal>,
    id: u64,
    name: &'static str,
    table: String,
    applied: Vec<String>,
    current: Option<String>,
}

impl<'a> Operation<'a> {
    fn begin(
        store: &'a dyn Store,
        mut journal: MutexGuard<'a, DdlJournal>,
        name: &'static str,
        table: &str,
        column: Option<&str>,
    ) -> Result<Self> {
        let id = journal.begin(name, table, column)?;
        Ok(Self {
            store,
            journal,
            id,
            name,
            table: table.to_string(),
            applied: Vec::new(),
            current: None,
        })
    }

    fn start(&mut self, phase: &str) -> Result<()> {
        self.journal.phase_started(self.id, phase)?;
        self.current = Some(phase.to_string());
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        if let Some(phase) = self.current.take() {
            self.journal.phase_applied(self.id, &phase)?;
            self.applied.push(phase);
        }
        Ok(())
    }

    /// Fail the current phase with `err`, attaching the phase name.
    fn fail(&mut self, err: GuardError) -> GuardError {
        match self.current.take() {
            Some(phase) => {
                if let Err(j) = self.journal.phase_failed(self.id, &phase, &err.to_string()) {
                    warn!("could not journal failed phase {}: {}", phase, j);
                }
                err.in_phase(phase)
            }
            None => err,
        }
    }

    /// Record the current phase as failed without aborting the operation.
    fn tolerate(&mut self, err: &GuardError) -> Result<()> {
        if let Some(phase) = self.current.take() {
            self.journal.phase_failed(self.id, &phase, &err.to_string())?;
        }
        Ok(())
    }

    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        debug!(operation = self.name, "ddl: {}", sql);
        match self.store.execute(sql, params).await {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Record>> {
        debug!(operation = self.name, "ddl check: {}", sql);
        match self.store.query(sql, params).await {
            Ok(rows) => Ok(rows),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Run a `SELECT EXISTS (...) AS found` check.
    async fn found(&mut self, sql: &str) -> Result<bool> {
        let rows = self.query(sql, &[]).await?;
        Ok(rows
            .first()
            .and_then(|r| r.get_bool("found"))
            .unwrap_or(false))
    }

    /// Run `statements` as one complete phase.
    async fn phase(&mut self, phase: &str, statements: &[String]) -> Result<()> {
        self.start(phase)?;
        for sql in statements {
            self.exec(sql, &[]).await?;
        }
        self.done()
    }
}

struct AddColumnPlan<'p> {
    table: &'p TableDescriptor,
    name: &'p str,
    sql_type: &'p str,
    constraints: &'p ColumnConstraints,
    default: Option<&'p str>,
    reference: Option<(String, String)>,
}

impl AddColumnPlan<'_> {
    async fn run(&self, op: &mut Operation<'_>) -> Result<AddColumnOutcome> {
        let t = self.table;
        let c = self.constraints;
        let q_table = qualify_pg(&t.schema, &t.name)?;
        let q_col = quote_pg(self.name)?;
        let mut warnings = Vec::new();

        let mut add = format!("ALTER TABLE {} ADD COLUMN {} {}", q_table, q_col, self.sql_type);
        if let Some(default) = self.default {
            add.push_str(&format!(" DEFAULT {}", default));
        }
        op.phase(PHASE_ADD_COLUMN, &[add]).await?;

        if let Some(default) = self.default {
            op.phase(
                PHASE_BACKFILL,
                &[format!(
                    "UPDATE {} SET {} = {} WHERE {} IS NULL",
                    q_table, q_col, default, q_col
                )],
            )
            .await?;
        }

        if let Some(check) = &c.check {
            let existing: HashSet<&str> = t.check_constraints.iter().map(|c| c.name.as_str()).collect();
            let name = unused_name(&derived_name(&t.name, self.name, "check"), &existing);
            op.phase(
                PHASE_ADD_CHECK,
                &[format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({})",
                    q_table,
                    quote_pg(&name)?,
                    check
                )],
            )
            .await?;
        }

        if !c.nullable && !c.primary_key {
            set_not_null(op, &t.name, self.name, &q_table, &q_col).await?;
        }

        if c.unique && !c.primary_key {
            op.start(PHASE_ADD_UNIQUE)?;
            if op.found(&duplicates_sql(&q_table, &q_col)).await? {
                return Err(op.fail(GuardError::integrity_risk(
                    &t.name,
                    self.name,
                    "existing rows contain duplicate values",
                )));
            }
            let name = derived_name(&t.name, self.name, "key");
            op.exec(
                &format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                    q_table,
                    quote_pg(&name)?,
                    q_col
                ),
                &[],
            )
            .await?;
            op.done()?;
        }

        if c.primary_key {
            self.add_primary_key(op, &q_table, &q_col).await?;
        }

        if c.autoincrement {
            op.start(PHASE_ADD_IDENTITY)?;
            op.exec(
                &format!(
                    "ALTER TABLE {} ALTER COLUMN {} ADD GENERATED BY DEFAULT AS IDENTITY",
                    q_table, q_col
                ),
                &[],
            )
            .await?;
            op.query(
                &format!(
                    "SELECT setval(pg_get_serial_sequence($1::text, $2::text), \
                     COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
                    q_col, q_table
                ),
                &[SqlValue::Text(q_table.clone()), SqlValue::from(self.name)],
            )
            .await?;
            op.done()?;
        }

        if let Some((ref_table, ref_column)) = &self.reference {
            let name = derived_name(&t.name, self.name, "fkey");
            let q_name = quote_pg(&name)?;
            op.phase(
                PHASE_ADD_FK,
                &[format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) NOT VALID",
                    q_table,
                    q_name,
                    q_col,
                    qualify_pg(&t.schema, ref_table)?,
                    quote_pg(ref_column)?
                )],
            )
            .await?;

            op.start(PHASE_VALIDATE_FK)?;
            let validate = format!("ALTER TABLE {} VALIDATE CONSTRAINT {}", q_table, q_name);
            match op.store.execute(&validate, &[]).await {
                Ok(_) => op.done()?,
                Err(e) => {
                    op.tolerate(&e)?;
                    warnings.push(format!(
                        "foreign key {} left NOT VALID; existing rows were not checked: {}",
                        name, e
                    ));
                }
            }
        }

        Ok(AddColumnOutcome {
            phases_applied: op.applied.clone(),
            warnings,
        })
    }

    async fn add_primary_key(&self, op: &mut Operation<'_>, q_table: &str, q_col: &str) -> Result<()> {
        let t = self.table;
        op.start(PHASE_ADD_PK)?;
        let has_nulls = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {} IS NULL) AS found",
            q_table, q_col
        );
        if op.found(&has_nulls).await? {
            if !is_integer_type(self.sql_type) {
                return Err(op.fail(GuardError::integrity_risk(
                    &t.name,
                    self.name,
                    "existing rows are NULL and only integer keys can be numbered",
                )));
            }
            op.exec(
                &format!(
                    "UPDATE {t} SET {c} = n.rn + COALESCE((SELECT MAX({c}) FROM {t}), 0) \
                     FROM (SELECT ctid, row_number() OVER (ORDER BY ctid) AS rn FROM {t} WHERE {c} IS NULL) AS n \
                     WHERE {t}.ctid = n.ctid",
                    t = q_table,
                    c = q_col
                ),
                &[],
            )
            .await?;
            if op.found(&has_nulls).await? {
                return Err(op.fail(GuardError::integrity_risk(
                    &t.name,
                    self.name,
                    "NULL values remain after numbering",
                )));
            }
        }
        if op.found(&duplicates_sql(q_table, q_col)).await? {
            return Err(op.fail(GuardError::integrity_risk(
                &t.name,
                self.name,
                "existing rows contain duplicate values",
            )));
        }
        op.exec(
            &format!("ALTER TABLE {} ALTER COLUMN {} SET NOT NULL", q_table, q_col),
            &[],
        )
        .await?;
        op.exec(
            &format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                q_table,
                quote_pg(&derived_name(&t.name, "", "pkey"))?,
                q_col
            ),
            &[],
        )
        .await?;
        op.done()
    }
}

/// NULL scan, then `SET NOT NULL`, as one phase.
async fn set_not_null(
    op: &mut Operation<'_>,
    table: &str,
    column: &str,
    q_table: &str,
    q_col: &str,
) -> Result<()> {
    op.start(PHASE_SET_NOT_NULL)?;
    let has_nulls = format!(
        "SELECT EXISTS (SELECT 1 FROM {} WHERE {} IS NULL) AS found",
        q_table, q_col
    );
    if op.found(&has_nulls).await? {
        return Err(op.fail(GuardError::integrity_risk(
            table,
            column,
            "existing rows are NULL; supply a default first",
        )));
    }
    op.exec(
        &format!("ALTER TABLE {} ALTER COLUMN {} SET NOT NULL", q_table, q_col),
        &[],
    )
    .await?;
    op.done()
}

fn duplicates_sql(q_table: &str, q_col: &str) -> String {
    format!(
        "SELECT EXISTS (SELECT 1 FROM {t} WHERE {c} IS NOT NULL GROUP BY {c} HAVING COUNT(*) > 1) AS found",
        t = q_table,
        c = q_col
    )
}

fn create_enum_sql(q_name: &str, labels: &[String]) -> Result<String> {
    let literals = labels
        .iter()
        .map(|l| quote_literal(&SqlValue::Text(l.clone())))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("CREATE TYPE {} AS ENUM ({})", q_name, literals.join(", ")))
}

fn column_definition(
    snapshot: &CatalogSnapshot,
    table: &str,
    columns: &[ColumnSpec],
    spec: &ColumnSpec,
) -> Result<String> {
    validate_identifier(&spec.name)?;
    validate_type_name(&spec.sql_type)?;
    let c = &spec.constraints;

    let mut def = format!("{} {}", quote_pg(&spec.name)?, spec.sql_type);
    if c.autoincrement {
        if !is_integer_type(&spec.sql_type) || c.default.is_some() {
            return Err(GuardError::schema(format!(
                "autoincrement column '{}' must be an integer without a default",
                spec.name
            )));
        }
        def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
    }
    if !c.nullable || c.primary_key {
        def.push_str(" NOT NULL");
    }
    if let Some(value) = &c.default {
        def.push_str(&format!(" DEFAULT {}", quote_literal(value)?));
    }
    if c.unique && !c.primary_key {
        def.push_str(" UNIQUE");
    }
    if let Some(check) = &c.check {
        validate_check_constraint(check)?;
        def.push_str(&format!(" CHECK ({})", check));
    }
    if let Some(reference) = &c.foreign_key {
        let (ref_table, ref_column) = parse_reference(reference)?;
        if ref_table == table {
            if !columns.iter().any(|s| s.name == ref_column) {
                return Err(GuardError::schema(format!(
                    "'{}' references unknown column '{}'",
                    spec.name, reference
                )));
            }
        } else {
            check_reference(snapshot, ref_table, ref_column)?;
        }
        def.push_str(&format!(
            " REFERENCES {} ({})",
            qualify_pg(snapshot.schema(), ref_table)?,
            quote_pg(ref_column)?
        ));
    }
    Ok(def)
}

fn column_of<'t>(table: &'t TableDescriptor, name: &str) -> Result<&'t ColumnDescriptor> {
    table.column(name).ok_or_else(|| {
        GuardError::schema(format!("table '{}' has no column '{}'", table.name, name))
    })
}

/// Split `table.column`.
fn parse_reference(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once('.') {
        Some((table, column)) if !table.is_empty() && !column.is_empty() => Ok((table, column)),
        _ => Err(GuardError::schema(format!(
            "foreign key reference '{}' is not of the form table.column",
            spec
        ))),
    }
}

fn check_reference(snapshot: &CatalogSnapshot, table: &str, column: &str) -> Result<()> {
    column_of(snapshot.table(table)?, column).map(|_| ())
}

/// Objects that depend on `column`, described for error messages.
fn column_dependents(snapshot: &CatalogSnapshot, table: &TableDescriptor, column: &str) -> Vec<String> {
    let mut dependents = Vec::new();
    for fk in &table.foreign_keys {
        let uses = fk.columns.iter().any(|c| c == column);
        let self_referenced =
            fk.ref_table == table.name && fk.ref_columns.iter().any(|c| c == column);
        if uses || self_referenced {
            dependents.push(format!("foreign key {}", fk.name));
        }
    }
    for (child, fk) in snapshot.referencing(&table.name, Some(column)) {
        dependents.push(format!("foreign key {}.{}", child, fk.name));
    }
    for check in &table.check_constraints {
        if mentions_column(&check.definition, column) {
            dependents.push(format!("check {}", check.name));
        }
    }
    for index in &table.indexes {
        if index.columns.iter().any(|c| c == column) {
            dependents.push(format!("index {}", index.name));
        }
    }
    dependents
}

/// `<table>_<column>_<suffix>` (or `<table>_<suffix>`), cut to the identifier limit.
fn derived_name(table: &str, column: &str, suffix: &str) -> String {
    let mut name = if column.is_empty() {
        format!("{}_{}", table, suffix)
    } else {
        format!("{}_{}_{}", table, column, suffix)
    };
    if name.len() > MAX_NAME_LEN {
        let mut cut = MAX_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

fn unused_name(base: &str, taken: &HashSet<&str>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{}{}", base, n))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .unwrap_or_else(|| base.to_string())
}

fn is_integer_type(sql_type: &str) -> bool {
    matches!(
        sql_type.trim().to_ascii_lowercase().as_str(),
        "smallint" | "integer" | "int" | "bigint" | "int2" | "int4" | "int8"
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TypeFamily {
    Integer,
    Numeric,
    Boolean,
    Text,
    Other,
}

fn type_family(sql_type: &str) -> TypeFamily {
    let lower = sql_type.trim().to_ascii_lowercase();
    let base = lower.split('(').next().unwrap_or_default().trim();
    if is_integer_type(base) {
        return TypeFamily::Integer;
    }
    match base {
        "numeric" | "decimal" | "real" | "double precision" | "float4" | "float8" | "money" => {
            TypeFamily::Numeric
        }
        "boolean" | "bool" => TypeFamily::Boolean,
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" => {
            TypeFamily::Text
        }
        _ => TypeFamily::Other,
    }
}

/// `USING` expression converting the column's current values to `target`.
const TRUE_LABELS: &str = "'true', 't', 'yes', 'y', '1'";
const FALSE_LABELS: &str = "'false', 'f', 'no', 'n', '0'";

/// Non-null text the boolean cast would silently turn into NULL.
fn unreadable_boolean_sql(q_table: &str, q_col: &str) -> String {
    format!(
        "SELECT EXISTS (SELECT 1 FROM {q_table} WHERE {q_col} IS NOT NULL \
         AND lower(trim({q_col})) NOT IN ({TRUE_LABELS}, {FALSE_LABELS})) AS found"
    )
}

fn infer_cast(column: &ColumnDescriptor, target: &str) -> Result<String> {
    let c = quote_pg(&column.name)?;
    let family = type_family(target);
    Ok(match (&column.kind, family) {
        (ColumnKind::Boolean, TypeFamily::Text) => {
            format!("CASE WHEN {c} THEN 'true' WHEN NOT {c} THEN 'false' END")
        }
        (ColumnKind::String, TypeFamily::Boolean) => format!(
            "CASE WHEN lower(trim({c})) IN ({TRUE_LABELS}) THEN true \
             WHEN lower(trim({c})) IN ({FALSE_LABELS}) THEN false END"
        ),
        (ColumnKind::String, TypeFamily::Integer | TypeFamily::Numeric) => {
            format!("NULLIF(trim({c}), '')::{target}")
        }
        (ColumnKind::Enum { .. }, _) => format!("{c}::text::{target}"),
        _ => format!("{c}::{target}"),
    })
}
