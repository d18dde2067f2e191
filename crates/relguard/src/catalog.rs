//! In-process mirror of the live schema.
//!
//! A [`CatalogSnapshot`] is immutable once built. [`SchemaCatalog`] holds the
//! current snapshot behind an `Arc` and swaps it wholesale on refresh, so a
//! reader keeps a consistent view for as long as it holds its `Arc`, even if
//! a refresh completes in the meantime.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::constraints::interpret_table;
use crate::core::schema::{ColumnDescriptor, ForeignKey, TableDescriptor};
use crate::core::traits::SchemaReader;
use crate::error::{GuardError, Result};
use crate::events::{Event, EventSink};
use crate::joins::JoinMapper;

/// Immutable view of one schema at one point in time.
#[derive(Debug)]
pub struct CatalogSnapshot {
    schema: String,
    generation: u64,
    built_at: DateTime<Utc>,
    tables: BTreeMap<String, Arc<TableDescriptor>>,
    enums: BTreeMap<String, Vec<String>>,
    joins: JoinMapper,
}

impl CatalogSnapshot {
    /// Build a snapshot from reflected descriptors.
    ///
    /// Interprets CHECK constraints, marks primary-key columns non-nullable
    /// and rejects duplicate table or column names.
    pub fn assemble(
        schema: impl Into<String>,
        generation: u64,
        reflected: Vec<TableDescriptor>,
        enums: BTreeMap<String, Vec<String>>,
    ) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for mut table in reflected {
            let mut seen = HashSet::new();
            for column in &table.columns {
                if !seen.insert(column.name.as_str()) {
                    return Err(GuardError::schema(format!(
                        "Duplicate column '{}' in table '{}'",
                        column.name, table.name
                    )));
                }
            }

            for pk in table.primary_key.clone() {
                let Some(column) = table.columns.iter_mut().find(|c| c.name == pk) else {
                    return Err(GuardError::schema(format!(
                        "Primary key column '{}' missing from table '{}'",
                        pk, table.name
                    )));
                };
                column.is_primary_key = true;
                column.is_nullable = false;
            }

            table.rules = interpret_table(&table);
            let name = table.name.clone();
            if tables.insert(name.clone(), Arc::new(table)).is_some() {
                return Err(GuardError::schema(format!("Duplicate table '{}'", name)));
            }
        }

        let joins = JoinMapper::build(tables.values().map(|t| t.as_ref()));

        Ok(Self {
            schema: schema.into(),
            generation,
            built_at: Utc::now(),
            tables,
            enums,
            joins,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Monotonic build counter; the first snapshot is generation 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Look up a table; unknown names are a schema error.
    pub fn table(&self, name: &str) -> Result<&Arc<TableDescriptor>> {
        self.tables
            .get(name)
            .ok_or_else(|| GuardError::schema(format!("Unknown table '{}'", name)))
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Table names in sorted order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values().map(|t| t.as_ref())
    }

    /// Labels of an enum type, in declaration order.
    pub fn enum_values(&self, type_name: &str) -> Option<&[String]> {
        self.enums.get(type_name).map(Vec::as_slice)
    }

    pub fn enums(&self) -> &BTreeMap<String, Vec<String>> {
        &self.enums
    }

    /// Join lookup built from this snapshot's foreign keys.
    pub fn joins(&self) -> &JoinMapper {
        &self.joins
    }

    /// Foreign keys in other tables that reference `table` (and `column`, if given).
    pub fn referencing(&self, table: &str, column: Option<&str>) -> Vec<(&str, &ForeignKey)> {
        self.tables()
            .flat_map(|t| t.foreign_keys.iter().map(move |fk| (t.name.as_str(), fk)))
            .filter(|(child, fk)| {
                fk.ref_table == table
                    && *child != table
                    && column.map_or(true, |c| fk.ref_columns.iter().any(|rc| rc == c))
            })
            .collect()
    }
}

/// The current catalog snapshot plus the means to rebuild it.
pub struct SchemaCatalog {
    reader: Arc<dyn SchemaReader>,
    schema: String,
    current: RwLock<Arc<CatalogSnapshot>>,
    generations: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl SchemaCatalog {
    /// Reflect `schema` and publish the first snapshot.
    pub async fn build(
        reader: Arc<dyn SchemaReader>,
        schema: impl Into<String>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let schema = schema.into();
        let snapshot = Self::load(reader.as_ref(), &schema, 1).await?;
        events.record(Event::info(
            "build_catalog",
            format!(
                "catalog built: {} tables, {} enum types",
                snapshot.tables.len(),
                snapshot.enums.len()
            ),
        ));
        Ok(Self {
            reader,
            schema,
            current: RwLock::new(Arc::new(snapshot)),
            generations: AtomicU64::new(1),
            events,
        })
    }

    async fn load(
        reader: &dyn SchemaReader,
        schema: &str,
        generation: u64,
    ) -> Result<CatalogSnapshot> {
        let enums = reader.extract_enums(schema).await?;
        let tables = reader.extract_schema(schema).await?;
        debug!(
            "Assembling catalog generation {} from {} tables",
            generation,
            tables.len()
        );
        CatalogSnapshot::assemble(schema, generation, tables, enums)
    }

    /// Reflect again and atomically replace the current snapshot.
    ///
    /// On failure the previous snapshot stays current.
    pub async fn refresh(&self) -> Result<Arc<CatalogSnapshot>> {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = match Self::load(self.reader.as_ref(), &self.schema, generation).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.events
                    .record(Event::error("refresh_catalog", format!("refresh failed: {}", e)));
                return Err(e);
            }
        };

        {
            let mut current = self.current.write();
            // A slower refresh that started earlier must not overwrite a newer one.
            if current.generation < snapshot.generation {
                *current = Arc::clone(&snapshot);
            }
        }

        info!(
            "Catalog refreshed: generation {}, {} tables",
            generation,
            snapshot.tables.len()
        );
        self.events.record(Event::info(
            "refresh_catalog",
            format!("generation {}: {} tables", generation, snapshot.tables.len()),
        ));
        Ok(self.snapshot())
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<TableDescriptor>> {
        self.snapshot().table(name).cloned()
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.snapshot().table_names()
    }

    /// Columns of a table in ordinal order.
    pub fn list_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        Ok(self.get_table(table)?.columns.clone())
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.snapshot()
            .table(table)
            .map(|t| t.has_column(column))
            .unwrap_or(false)
    }

    pub fn enum_values(&self, type_name: &str) -> Option<Vec<String>> {
        self.snapshot().enum_values(type_name).map(<[String]>::to_vec)
    }
}
