//! PostgreSQL store: the single guarded session.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, trace, warn};

use super::errors::{classify, classify_pool};
use crate::config::DatabaseConfig;
use crate::core::traits::Store;
use crate::core::value::{Record, SqlValue};
use crate::drivers::common::{SslMode, TlsBuilder};
use crate::error::{GuardError, Result};

/// PostgreSQL store backed by a one-connection pool.
///
/// All operations of a [`Guard`](crate::Guard) are awaited one after the
/// other, so a single connection is enough. The pool reconnects after the
/// server drops the session.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Connect using the given descriptor and verify the session with `SELECT 1`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("relguard");
        pg_config.connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs));
        pg_config.keepalives(true);
        pg_config.keepalives_idle(std::time::Duration::from_secs(60));

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        let pool = match TlsBuilder::new(ssl_mode).build()? {
            None => {
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr).max_size(1).build()
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr).max_size(1).build()
            }
        }
        .map_err(|e| GuardError::Config(format!("creating PostgreSQL pool: {}", e)))?;

        let store = Self { pool };
        store.ping().await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{} (ssl_mode={})",
            config.host, config.port, config.database, ssl_mode
        );
        Ok(store)
    }

    async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| classify_pool(e, &format!("getting connection for {}", context)))
    }
}

fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Record>> {
        trace!(sql, params = params.len(), "query");
        let client = self.client("query").await?;
        let rows = client
            .query(sql, &bind(params))
            .await
            .map_err(|e| classify(e, "running query"))?;

        let records: Vec<Record> = rows.iter().map(decode_row).collect();
        debug!("query returned {} rows", records.len());
        Ok(records)
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        trace!(sql, params = params.len(), "execute");
        let client = self.client("execute").await?;
        client
            .execute(sql, &bind(params))
            .await
            .map_err(|e| classify(e, "executing statement"))
    }

    async fn ping(&self) -> Result<()> {
        let client = self.client("ping").await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| classify(e, "testing PostgreSQL connection"))?;
        Ok(())
    }
}

fn decode_row(row: &tokio_postgres::Row) -> Record {
    let columns = row.columns();
    Record {
        columns: columns.iter().map(|c| c.name().to_string()).collect(),
        values: (0..columns.len())
            .map(|idx| decode_value(row, idx, columns[idx].type_()))
            .collect(),
    }
}

/// Convert a PostgreSQL row value to [`SqlValue`].
fn decode_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> SqlValue {
    fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }

    let value = match *ty {
        Type::BOOL => get::<bool>(row, idx).map(SqlValue::Bool),
        Type::INT2 => get::<i16>(row, idx).map(|v| SqlValue::Int(v as i64)),
        Type::INT4 => get::<i32>(row, idx).map(|v| SqlValue::Int(v as i64)),
        Type::INT8 => get::<i64>(row, idx).map(SqlValue::Int),
        Type::OID => get::<u32>(row, idx).map(|v| SqlValue::Int(v as i64)),
        Type::FLOAT4 => get::<f32>(row, idx).map(|v| SqlValue::Float(v as f64)),
        Type::FLOAT8 => get::<f64>(row, idx).map(SqlValue::Float),
        Type::NUMERIC => get::<rust_decimal::Decimal>(row, idx).map(SqlValue::Decimal),
        Type::DATE => get::<chrono::NaiveDate>(row, idx).map(SqlValue::Date),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx).map(SqlValue::DateTime),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|v| SqlValue::DateTime(v.naive_utc())),
        Type::UUID => get::<uuid::Uuid>(row, idx).map(SqlValue::Uuid),
        Type::JSON | Type::JSONB => {
            get::<serde_json::Value>(row, idx).map(|v| SqlValue::Text(v.to_string()))
        }
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY | Type::BPCHAR_ARRAY => {
            get::<Vec<Option<String>>>(row, idx).map(|items| {
                SqlValue::Array(items.into_iter().map(SqlValue::from).collect())
            })
        }
        Type::INT2_ARRAY => get::<Vec<Option<i16>>>(row, idx).map(|items| {
            SqlValue::Array(items.into_iter().map(|v| SqlValue::from(v.map(i64::from))).collect())
        }),
        Type::INT4_ARRAY => get::<Vec<Option<i32>>>(row, idx).map(|items| {
            SqlValue::Array(items.into_iter().map(SqlValue::from).collect())
        }),
        Type::INT8_ARRAY => get::<Vec<Option<i64>>>(row, idx).map(|items| {
            SqlValue::Array(items.into_iter().map(SqlValue::from).collect())
        }),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map(SqlValue::Text),
            Err(_) => {
                warn!(
                    "column '{}' has type {} without a decoder; project it as ::text",
                    row.columns()[idx].name(),
                    ty
                );
                None
            }
        },
    };
    value.unwrap_or(SqlValue::Null)
}
