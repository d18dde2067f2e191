//! The facade tying every component to one store session.

use std::sync::Arc;

use tracing::{info, warn};

use crate::catalog::SchemaCatalog;
use crate::config::{Config, GuardConfig};
use crate::core::schema::TableDescriptor;
use crate::core::traits::{SchemaReader, Store};
use crate::core::value::{Record, RowMap, SqlValue};
use crate::crud::CrudExecutor;
use crate::ddl::{DdlEntry, DdlJournal, SchemaMutator};
use crate::drivers::PgStore;
use crate::error::Result;
use crate::events::{tracing_sink, Event, EventSink};
use crate::joins::JoinEdge;
use crate::validate::{ValidationMode, Violation};

/// Catalog, CRUD executor and schema mutator over one store.
///
/// Operations are awaited one at a time; the store holds a single session.
pub struct Guard {
    store: Arc<dyn Store>,
    catalog: Arc<SchemaCatalog>,
    crud: CrudExecutor,
    ddl: SchemaMutator,
    events: Arc<dyn EventSink>,
}

impl Guard {
    /// Connect to PostgreSQL, reflect the configured schema and open the
    /// DDL journal. Events go to `tracing`.
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::connect_with_events(config, tracing_sink()).await
    }

    pub async fn connect_with_events(config: &Config, events: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let fingerprint = config.database_fingerprint();
        let journal = match &config.guard.ddl_journal {
            Some(path) => DdlJournal::open(path, &fingerprint)?,
            None => DdlJournal::in_memory(fingerprint),
        };

        let pg = Arc::new(PgStore::connect(&config.database).await?);
        let guard = Self::from_parts(
            pg.clone(),
            pg,
            &config.database.schema,
            &config.guard,
            journal,
            events,
        )
        .await?;

        info!(
            "Guard ready: {} tables in schema {}",
            guard.catalog.list_tables().len(),
            config.database.schema
        );
        Ok(guard)
    }

    /// Assemble a guard from an existing store and reader.
    ///
    /// Interrupted DDL found in the journal is reported as a warning event.
    pub async fn from_parts(
        store: Arc<dyn Store>,
        reader: Arc<dyn SchemaReader>,
        schema: &str,
        config: &GuardConfig,
        journal: DdlJournal,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let catalog = Arc::new(SchemaCatalog::build(reader, schema, events.clone()).await?);
        let crud = CrudExecutor::new(store.clone(), catalog.clone(), config, events.clone());

        let interrupted = journal.pending();
        for entry in &interrupted {
            warn!(
                "DDL operation {} ({}) on {} was interrupted after phases [{}]",
                entry.id,
                entry.operation,
                entry.table,
                entry.applied_phases().join(", ")
            );
            events.record(
                Event::warn(
                    "ddl_journal",
                    format!(
                        "{} #{} never finished; applied: [{}]",
                        entry.operation,
                        entry.id,
                        entry.applied_phases().join(", ")
                    ),
                )
                .table(&entry.table),
            );
        }

        let ddl = SchemaMutator::new(store.clone(), catalog.clone(), journal, events.clone());
        Ok(Self {
            store,
            catalog,
            crud,
            ddl,
            events,
        })
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn crud(&self) -> &CrudExecutor {
        &self.crud
    }

    pub fn ddl(&self) -> &SchemaMutator {
        &self.ddl
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Check the store session.
    pub async fn health_check(&self) -> Result<()> {
        self.store.ping().await
    }

    pub fn describe(&self, table: &str) -> Result<Arc<TableDescriptor>> {
        self.catalog.get_table(table)
    }

    /// Join edges derived from single-column foreign keys.
    pub fn join_edges(&self) -> Vec<JoinEdge> {
        self.catalog.snapshot().joins().edges().to_vec()
    }

    pub async fn find_free_id(&self, table: &str) -> Result<i64> {
        let table = self.catalog.get_table(table)?;
        self.crud.id_allocator().find_free_id(&table).await
    }

    /// Validate `row` without touching the store.
    pub fn validate(&self, table: &str, row: &RowMap, mode: ValidationMode) -> Result<Vec<Violation>> {
        let table = self.catalog.get_table(table)?;
        Ok(self.crud.validator().validate(&table, row, mode))
    }

    /// Run a parameterized query as-is, without validation.
    pub async fn query_raw(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Record>> {
        self.events
            .record(Event::debug("query_raw", format!("{} params", params.len())));
        self.store.query(sql, params).await.map_err(|e| {
            self.events.record(Event::error("query_raw", e.to_string()));
            e
        })
    }

    /// Execute a parameterized statement as-is, without validation.
    ///
    /// Structural changes made this way are not seen until [`refresh`](Self::refresh).
    pub async fn execute_raw(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.events
            .record(Event::debug("execute_raw", format!("{} params", params.len())));
        self.store.execute(sql, params).await.map_err(|e| {
            self.events.record(Event::error("execute_raw", e.to_string()));
            e
        })
    }

    /// Re-reflect the schema; returns the new catalog generation.
    pub async fn refresh(&self) -> Result<u64> {
        Ok(self.ddl.refresh_catalog().await?.generation())
    }

    /// DDL operations a previous process left unfinished.
    pub async fn pending_ddl(&self) -> Vec<DdlEntry> {
        self.ddl.pending().await
    }

    pub async fn acknowledge_pending_ddl(&self) -> Result<usize> {
        self.ddl.acknowledge_pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::row;
    use crate::events::{EventLevel, MemorySink};
    use crate::testing::{rec, ScriptedStore, StaticReader};
    use tempfile::TempDir;

    async fn guard_with(journal: DdlJournal) -> (Guard, Arc<ScriptedStore>, Arc<MemorySink>) {
        let store = ScriptedStore::new();
        let sink = MemorySink::new();
        let guard = Guard::from_parts(
            store.clone(),
            StaticReader::library(),
            "public",
            &GuardConfig::default(),
            journal,
            sink.clone(),
        )
        .await
        .unwrap();
        (guard, store, sink)
    }

    #[tokio::test]
    async fn test_facade_delegates() {
        let (guard, store, _) = guard_with(DdlJournal::in_memory("db")).await;
        assert_eq!(guard.catalog().list_tables(), vec!["books", "loan_records", "readers"]);
        assert_eq!(guard.describe("readers").unwrap().primary_key, vec!["reader_id"]);
        assert!(guard.describe("members").is_err());
        assert_eq!(guard.join_edges().len(), 2);

        store.on_query("MAX(", vec![rec([("max_id", SqlValue::Int(2))])]);
        store.on_query("generate_series", vec![rec([("id", SqlValue::Int(3))])]);
        assert_eq!(guard.find_free_id("books").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_validate_issues_no_sql() {
        let (guard, store, _) = guard_with(DdlJournal::in_memory("db")).await;
        let violations = guard
            .validate("readers", &row([("full_name", SqlValue::from("Ann"))]), ValidationMode::Insert)
            .unwrap();
        assert!(violations.is_empty());

        let violations = guard
            .validate("readers", &row([("deposit_amount", SqlValue::Int(-5))]), ValidationMode::Update)
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_raw_statements_pass_through() {
        let (guard, store, sink) = guard_with(DdlJournal::in_memory("db")).await;
        store.on_execute("VACUUM", 0);
        guard.execute_raw("VACUUM ANALYZE \"public\".\"books\"", &[]).await.unwrap();
        store.fail_on("pg_sleep", || crate::error::GuardError::Statement("canceled".into()));
        assert!(guard
            .query_raw("SELECT pg_sleep($1::float8)", &[SqlValue::Float(1.0)])
            .await
            .is_err());
        assert!(sink.has("query_raw", EventLevel::Error));
    }

    #[tokio::test]
    async fn test_interrupted_ddl_reported_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ddl.json");
        let mut journal = DdlJournal::open(&path, "db").unwrap();
        let id = journal.begin("add_column", "books", Some("isbn13")).unwrap();
        journal.phase_started(id, "add_column").unwrap();
        journal.phase_applied(id, "add_column").unwrap();
        drop(journal);

        let (guard, _, sink) = guard_with(DdlJournal::open(&path, "db").unwrap()).await;
        assert_eq!(guard.pending_ddl().await.len(), 1);
        assert!(sink.has("ddl_journal", EventLevel::Warn));

        assert_eq!(guard.acknowledge_pending_ddl().await.unwrap(), 1);
        assert!(guard.pending_ddl().await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_bumps_generation() {
        let (guard, _, _) = guard_with(DdlJournal::in_memory("db")).await;
        assert_eq!(guard.refresh().await.unwrap(), 2);
    }
}
