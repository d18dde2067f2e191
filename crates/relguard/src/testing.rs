//! Test doubles: a scripted store and a static schema reader.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::catalog::{CatalogSnapshot, SchemaCatalog};
use crate::core::kind::ColumnKind;
use crate::core::schema::{CheckConstraint, ColumnDescriptor, ForeignKey, Index, TableDescriptor};
use crate::core::traits::{SchemaReader, Store};
use crate::core::value::{Record, SqlValue};
use crate::error::{GuardError, Result};
use crate::events::MemorySink;

type Failure = Box<dyn Fn() -> GuardError + Send + Sync>;

enum Response {
    Rows(Vec<Record>),
    Affected(u64),
    Fail(Failure),
}

struct Rule {
    pattern: String,
    response: Response,
}

/// A statement the store received.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Store answering by substring match on the SQL text.
///
/// The most recently added matching rule wins. Unmatched queries return no
/// rows, unmatched statements affect zero rows.
#[derive(Default)]
pub struct ScriptedStore {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<Statement>>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_query(&self, pattern: &str, rows: Vec<Record>) {
        self.push(pattern, Response::Rows(rows));
    }

    pub fn on_execute(&self, pattern: &str, affected: u64) {
        self.push(pattern, Response::Affected(affected));
    }

    pub fn fail_on(&self, pattern: &str, make: impl Fn() -> GuardError + Send + Sync + 'static) {
        self.push(pattern, Response::Fail(Box::new(make)));
    }

    fn push(&self, pattern: &str, response: Response) {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            response,
        });
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.log.lock().clone()
    }

    pub fn sql_log(&self) -> Vec<String> {
        self.log.lock().iter().map(|s| s.sql.clone()).collect()
    }

    /// Whether any received statement contains `pattern`.
    pub fn saw(&self, pattern: &str) -> bool {
        self.log.lock().iter().any(|s| s.sql.contains(pattern))
    }

    /// The last statement containing `pattern`.
    pub fn last(&self, pattern: &str) -> Option<Statement> {
        self.log
            .lock()
            .iter()
            .rev()
            .find(|s| s.sql.contains(pattern))
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.log.lock().len()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    fn answer(&self, sql: &str, params: &[SqlValue]) -> Outcome {
        self.log.lock().push(Statement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        let rules = self.rules.lock();
        match rules.iter().rev().find(|r| sql.contains(&r.pattern)) {
            None => Outcome::Unmatched,
            Some(rule) => match &rule.response {
                Response::Rows(rows) => Outcome::Rows(rows.clone()),
                Response::Affected(n) => Outcome::Affected(*n),
                Response::Fail(make) => Outcome::Fail(make()),
            },
        }
    }
}

enum Outcome {
    Unmatched,
    Rows(Vec<Record>),
    Affected(u64),
    Fail(GuardError),
}

#[async_trait]
impl Store for ScriptedStore {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Record>> {
        match self.answer(sql, params) {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Fail(err) => Err(err),
            Outcome::Unmatched | Outcome::Affected(_) => Ok(Vec::new()),
        }
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self.answer(sql, params) {
            Outcome::Rows(rows) => Ok(rows.len() as u64),
            Outcome::Affected(n) => Ok(n),
            Outcome::Fail(err) => Err(err),
            Outcome::Unmatched => Ok(0),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Schema reader serving fixed descriptors.
pub struct StaticReader {
    tables: Mutex<Vec<TableDescriptor>>,
    enums: Mutex<BTreeMap<String, Vec<String>>>,
}

impl StaticReader {
    pub fn new(tables: Vec<TableDescriptor>, enums: BTreeMap<String, Vec<String>>) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(tables),
            enums: Mutex::new(enums),
        })
    }

    pub fn library() -> Arc<Self> {
        Self::new(library_tables(), library_enums())
    }

    /// Change what the next reflection returns.
    pub fn update(&self, f: impl FnOnce(&mut Vec<TableDescriptor>)) {
        f(&mut self.tables.lock());
    }

    pub fn update_enums(&self, f: impl FnOnce(&mut BTreeMap<String, Vec<String>>)) {
        f(&mut self.enums.lock());
    }
}

#[async_trait]
impl SchemaReader for StaticReader {
    async fn extract_schema(&self, _schema: &str) -> Result<Vec<TableDescriptor>> {
        Ok(self.tables.lock().clone())
    }

    async fn extract_enums(
        &self,
        _schema: &str,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self.enums.lock().clone())
    }
}

/// Catalog over the library fixture, with its reader for simulating DDL.
pub async fn library_catalog() -> (Arc<SchemaCatalog>, Arc<StaticReader>) {
    let reader = StaticReader::library();
    let catalog = SchemaCatalog::build(reader.clone(), "public", MemorySink::new())
        .await
        .expect("library catalog builds");
    (Arc::new(catalog), reader)
}

/// Snapshot of the library fixture.
pub fn library_snapshot() -> CatalogSnapshot {
    CatalogSnapshot::assemble("public", 1, library_tables(), library_enums())
        .expect("library snapshot assembles")
}

pub fn rec<const N: usize>(pairs: [(&str, SqlValue); N]) -> Record {
    Record::from_pairs(pairs)
}

fn labels(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn library_enums() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        (
            "genre".to_string(),
            labels(&["fiction", "poetry", "science", "history"]),
        ),
        (
            "discount_category".to_string(),
            labels(&["none", "student", "senior"]),
        ),
        (
            "damage_type".to_string(),
            labels(&["none", "minor", "major", "lost"]),
        ),
    ])
}

fn column(name: &str, kind: ColumnKind, sql_type: &str, pos: i32) -> ColumnDescriptor {
    ColumnDescriptor {
        name: name.to_string(),
        kind,
        sql_type: sql_type.to_string(),
        is_nullable: true,
        default: None,
        is_primary_key: false,
        is_autoincrement: false,
        ordinal_pos: pos,
    }
}

fn not_null(mut c: ColumnDescriptor) -> ColumnDescriptor {
    c.is_nullable = false;
    c
}

fn with_default(mut c: ColumnDescriptor, default: &str) -> ColumnDescriptor {
    c.default = Some(default.to_string());
    c
}

fn enum_kind(type_name: &str) -> ColumnKind {
    ColumnKind::Enum {
        type_name: type_name.to_string(),
        values: library_enums()[type_name].clone(),
    }
}

fn fk(table: &str, column: &str, ref_table: &str) -> ForeignKey {
    ForeignKey {
        name: format!("{}_{}_fkey", table, column),
        columns: vec![column.to_string()],
        ref_table: ref_table.to_string(),
        ref_schema: "public".to_string(),
        ref_columns: vec![column.to_string()],
        on_delete: "NO_ACTION".to_string(),
        on_update: "NO_ACTION".to_string(),
    }
}

fn pk_index(table: &str, column: &str) -> Index {
    Index {
        name: format!("{}_pkey", table),
        columns: vec![column.to_string()],
        is_unique: true,
        is_primary: true,
    }
}

/// Books, readers and loan records, as reflected (rules not yet interpreted).
pub fn library_tables() -> Vec<TableDescriptor> {
    let mut books = TableDescriptor::new("public", "books");
    books.columns = vec![
        not_null(column("book_id", ColumnKind::Integer, "integer", 1)),
        not_null(column("title", ColumnKind::String, "character varying(200)", 2)),
        column("isbn", ColumnKind::String, "character varying(20)", 3),
        not_null(column("genre", enum_kind("genre"), "genre", 4)),
        column("price", ColumnKind::Numeric, "numeric(8,2)", 5),
        with_default(
            not_null(column("copies", ColumnKind::Integer, "integer", 6)),
            "1",
        ),
        column(
            "tags",
            ColumnKind::Array {
                element: Box::new(ColumnKind::String),
            },
            "text[]",
            7,
        ),
        column("published", ColumnKind::Date, "date", 8),
    ];
    books.primary_key = vec!["book_id".into()];
    books.unique_constraints = vec![vec!["isbn".into()]];
    books.indexes = vec![
        pk_index("books", "book_id"),
        Index {
            name: "books_isbn_key".into(),
            columns: vec!["isbn".into()],
            is_unique: true,
            is_primary: false,
        },
    ];
    books.check_constraints = vec![CheckConstraint {
        name: "books_price_check".into(),
        definition: "CHECK ((price >= (0)::numeric))".into(),
    }];

    let mut readers = TableDescriptor::new("public", "readers");
    let mut reader_id = not_null(column("reader_id", ColumnKind::Integer, "integer", 1));
    reader_id.is_autoincrement = true;
    readers.columns = vec![
        reader_id,
        not_null(column("full_name", ColumnKind::String, "text", 2)),
        column("email", ColumnKind::String, "text", 3),
        with_default(
            not_null(column("discount", enum_kind("discount_category"), "discount_category", 4)),
            "'none'::discount_category",
        ),
        with_default(
            not_null(column("deposit_amount", ColumnKind::Numeric, "numeric(10,2)", 5)),
            "0",
        ),
    ];
    readers.primary_key = vec!["reader_id".into()];
    readers.indexes = vec![pk_index("readers", "reader_id")];
    readers.check_constraints = vec![CheckConstraint {
        name: "readers_deposit_amount_check".into(),
        definition: "CHECK ((deposit_amount >= (0)::numeric))".into(),
    }];

    let mut loans = TableDescriptor::new("public", "loan_records");
    loans.columns = vec![
        not_null(column("loan_id", ColumnKind::Integer, "integer", 1)),
        not_null(column("book_id", ColumnKind::Integer, "integer", 2)),
        not_null(column("reader_id", ColumnKind::Integer, "integer", 3)),
        with_default(
            not_null(column("loan_date", ColumnKind::Date, "date", 4)),
            "CURRENT_DATE",
        ),
        column("due_date", ColumnKind::Date, "date", 5),
        column("actual_return_date", ColumnKind::Date, "date", 6),
        column("final_rental_cost", ColumnKind::Numeric, "numeric(8,2)", 7),
        column("actual_rental_days", ColumnKind::Integer, "integer", 8),
        column("damage", enum_kind("damage_type"), "damage_type", 9),
    ];
    loans.primary_key = vec!["loan_id".into()];
    loans.foreign_keys = vec![
        fk("loan_records", "book_id", "books"),
        fk("loan_records", "reader_id", "readers"),
    ];
    loans.indexes = vec![
        pk_index("loan_records", "loan_id"),
        Index {
            name: "loan_records_book_idx".into(),
            columns: vec!["book_id".into()],
            is_unique: false,
            is_primary: false,
        },
    ];
    loans.check_constraints = vec![
        CheckConstraint {
            name: "loan_records_return_after_loan".into(),
            definition:
                "CHECK (((actual_return_date IS NULL) OR (actual_return_date >= loan_date)))"
                    .into(),
        },
        CheckConstraint {
            name: "loan_records_completion_check".into(),
            definition: "CHECK ((((actual_return_date IS NULL) AND (final_rental_cost IS NULL) AND (actual_rental_days IS NULL)) OR ((actual_return_date IS NOT NULL) AND (final_rental_cost IS NOT NULL) AND (actual_rental_days IS NOT NULL))))".into(),
        },
        CheckConstraint {
            name: "loan_records_cost_check".into(),
            definition: "CHECK ((final_rental_cost >= (0)::numeric))".into(),
        },
    ];

    vec![books, readers, loans]
}
