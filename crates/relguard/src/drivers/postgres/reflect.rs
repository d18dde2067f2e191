//! Structural reflection of a PostgreSQL schema.
//!
//! One catalog query per object class (tables, columns, keys, foreign keys,
//! indexes, checks, enums), each covering the whole schema. Rows are folded
//! into descriptors keyed by table name.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info};

use super::store::PgStore;
use crate::core::kind::ColumnKind;
use crate::core::schema::{CheckConstraint, ColumnDescriptor, ForeignKey, Index, TableDescriptor};
use crate::core::traits::{SchemaReader, Store};
use crate::core::value::{Record, SqlValue};
use crate::error::Result;

const TABLES_SQL: &str = r#"
    SELECT table_name::text
    FROM information_schema.tables
    WHERE table_type = 'BASE TABLE'
      AND table_schema = $1::text
    ORDER BY table_name
"#;

// One row per type name; the target schema's type shadows a public one.
const ENUMS_SQL: &str = r#"
    SELECT DISTINCT ON (t.typname)
           t.typname::text AS type_name,
           ARRAY(
               SELECT e.enumlabel::text
               FROM pg_catalog.pg_enum e
               WHERE e.enumtypid = t.oid
               ORDER BY e.enumsortorder
           ) AS labels
    FROM pg_catalog.pg_type t
    JOIN pg_catalog.pg_namespace n ON n.oid = t.typnamespace
    WHERE t.typtype = 'e'
      AND (n.nspname = $1::text OR n.nspname = 'public')
    ORDER BY t.typname, (n.nspname = $1::text) DESC
"#;

const COLUMNS_SQL: &str = r#"
    SELECT
        c.table_name::text,
        c.column_name::text,
        c.udt_name::text,
        format_type(a.atttypid, a.atttypmod) AS sql_type,
        c.is_nullable = 'YES' AS is_nullable,
        c.column_default::text AS column_default,
        (a.attidentity IN ('a', 'd')
            OR COALESCE(c.column_default::text, '') LIKE 'nextval(%') AS is_autoincrement,
        c.ordinal_position::int4 AS ordinal_pos
    FROM information_schema.columns c
    JOIN pg_catalog.pg_namespace n ON n.nspname = c.table_schema
    JOIN pg_catalog.pg_class t ON t.relnamespace = n.oid AND t.relname = c.table_name
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
    WHERE c.table_schema = $1::text
    ORDER BY c.table_name, c.ordinal_position
"#;

const KEYS_SQL: &str = r#"
    SELECT
        t.relname::text AS table_name,
        c.contype::text AS contype,
        c.conname::text AS conname,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    WHERE n.nspname = $1::text
      AND c.contype IN ('p', 'u')
    ORDER BY t.relname, c.conname
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT
        t.relname::text AS table_name,
        c.conname::text AS fk_name,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns,
        rn.nspname::text AS ref_schema,
        rt.relname::text AS ref_table,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(c.confkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = c.confrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS ref_columns,
        CASE c.confdeltype
            WHEN 'a' THEN 'NO_ACTION'
            WHEN 'r' THEN 'RESTRICT'
            WHEN 'c' THEN 'CASCADE'
            WHEN 'n' THEN 'SET_NULL'
            WHEN 'd' THEN 'SET_DEFAULT'
            ELSE 'NO_ACTION'
        END AS on_delete,
        CASE c.confupdtype
            WHEN 'a' THEN 'NO_ACTION'
            WHEN 'r' THEN 'RESTRICT'
            WHEN 'c' THEN 'CASCADE'
            WHEN 'n' THEN 'SET_NULL'
            WHEN 'd' THEN 'SET_DEFAULT'
            ELSE 'NO_ACTION'
        END AS on_update
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
    JOIN pg_catalog.pg_namespace rn ON rn.oid = rt.relnamespace
    WHERE n.nspname = $1::text
      AND c.contype = 'f'
    ORDER BY t.relname, c.conname
"#;

const INDEXES_SQL: &str = r#"
    SELECT
        t.relname::text AS table_name,
        i.relname::text AS index_name,
        ix.indisunique AS is_unique,
        ix.indisprimary AS is_primary,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns
    FROM pg_catalog.pg_index ix
    JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
    JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    WHERE n.nspname = $1::text
      AND t.relkind = 'r'
    ORDER BY t.relname, i.relname
"#;

const CHECKS_SQL: &str = r#"
    SELECT t.relname::text AS table_name,
           c.conname::text AS conname,
           pg_get_constraintdef(c.oid) AS definition
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    WHERE n.nspname = $1::text AND c.contype = 'c'
    ORDER BY t.relname, c.conname
"#;

fn text(record: &Record, column: &str) -> String {
    record.get_str(column).unwrap_or_default().to_string()
}

/// Reflect `schema` through any store that speaks the PostgreSQL catalog.
pub async fn reflect_schema(store: &dyn Store, schema: &str) -> Result<Vec<TableDescriptor>> {
    let param = [SqlValue::from(schema)];

    let mut tables: BTreeMap<String, TableDescriptor> = store
        .query(TABLES_SQL, &param)
        .await?
        .iter()
        .map(|r| {
            let name = text(r, "table_name");
            (name.clone(), TableDescriptor::new(schema, name))
        })
        .collect();

    let enums = reflect_enums(store, schema).await?;
    load_columns(store, &param, &enums, &mut tables).await?;
    load_keys(store, &param, &mut tables).await?;
    load_foreign_keys(store, &param, &mut tables).await?;
    load_indexes(store, &param, &mut tables).await?;
    load_check_constraints(store, &param, &mut tables).await?;

    info!("Reflected {} tables from schema '{}'", tables.len(), schema);
    Ok(tables.into_values().collect())
}

/// Enum types with labels in declaration order.
pub async fn reflect_enums(
    store: &dyn Store,
    schema: &str,
) -> Result<BTreeMap<String, Vec<String>>> {
    let rows = store.query(ENUMS_SQL, &[SqlValue::from(schema)]).await?;
    Ok(rows
        .iter()
        .map(|r| (text(r, "type_name"), r.get_text_array("labels")))
        .collect())
}

async fn load_columns(
    store: &dyn Store,
    param: &[SqlValue],
    enums: &BTreeMap<String, Vec<String>>,
    tables: &mut BTreeMap<String, TableDescriptor>,
) -> Result<()> {
    let rows = store.query(COLUMNS_SQL, param).await?;
    for row in &rows {
        let Some(table) = tables.get_mut(&text(row, "table_name")) else {
            continue;
        };
        let udt_name = text(row, "udt_name");
        let column = ColumnDescriptor {
            name: text(row, "column_name"),
            kind: ColumnKind::classify(&udt_name, |name| enums.get(name).cloned()),
            sql_type: text(row, "sql_type"),
            is_nullable: row.get_bool("is_nullable").unwrap_or(true),
            default: row.get_str("column_default").map(str::to_string),
            is_primary_key: false,
            is_autoincrement: row.get_bool("is_autoincrement").unwrap_or(false),
            ordinal_pos: row.get_i64("ordinal_pos").unwrap_or(0) as i32,
        };
        table.columns.push(column);
    }
    debug!("Loaded {} columns", rows.len());
    Ok(())
}

async fn load_keys(
    store: &dyn Store,
    param: &[SqlValue],
    tables: &mut BTreeMap<String, TableDescriptor>,
) -> Result<()> {
    for row in store.query(KEYS_SQL, param).await? {
        let Some(table) = tables.get_mut(&text(&row, "table_name")) else {
            continue;
        };
        let columns = row.get_text_array("columns");
        match row.get_str("contype") {
            Some("p") => {
                for col in table.columns.iter_mut() {
                    if columns.contains(&col.name) {
                        col.is_primary_key = true;
                    }
                }
                table.primary_key = columns;
            }
            Some("u") => table.unique_constraints.push(columns),
            _ => {}
        }
    }
    Ok(())
}

async fn load_foreign_keys(
    store: &dyn Store,
    param: &[SqlValue],
    tables: &mut BTreeMap<String, TableDescriptor>,
) -> Result<()> {
    for row in store.query(FOREIGN_KEYS_SQL, param).await? {
        let Some(table) = tables.get_mut(&text(&row, "table_name")) else {
            continue;
        };
        table.foreign_keys.push(ForeignKey {
            name: text(&row, "fk_name"),
            columns: row.get_text_array("columns"),
            ref_table: text(&row, "ref_table"),
            ref_schema: text(&row, "ref_schema"),
            ref_columns: row.get_text_array("ref_columns"),
            on_delete: text(&row, "on_delete"),
            on_update: text(&row, "on_update"),
        });
    }
    Ok(())
}

async fn load_indexes(
    store: &dyn Store,
    param: &[SqlValue],
    tables: &mut BTreeMap<String, TableDescriptor>,
) -> Result<()> {
    for row in store.query(INDEXES_SQL, param).await? {
        let Some(table) = tables.get_mut(&text(&row, "table_name")) else {
            continue;
        };
        table.indexes.push(Index {
            name: text(&row, "index_name"),
            columns: row.get_text_array("columns"),
            is_unique: row.get_bool("is_unique").unwrap_or(false),
            is_primary: row.get_bool("is_primary").unwrap_or(false),
        });
    }
    Ok(())
}

async fn load_check_constraints(
    store: &dyn Store,
    param: &[SqlValue],
    tables: &mut BTreeMap<String, TableDescriptor>,
) -> Result<()> {
    for row in store.query(CHECKS_SQL, param).await? {
        let Some(table) = tables.get_mut(&text(&row, "table_name")) else {
            continue;
        };
        table.check_constraints.push(CheckConstraint {
            name: text(&row, "conname"),
            definition: text(&row, "definition"),
        });
    }
    Ok(())
}

#[async_trait]
impl SchemaReader for PgStore {
    async fn extract_schema(&self, schema: &str) -> Result<Vec<TableDescriptor>> {
        reflect_schema(self, schema).await
    }

    async fn extract_enums(&self, schema: &str) -> Result<BTreeMap<String, Vec<String>>> {
        reflect_enums(self, schema).await
    }
}
