//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection descriptor for the PostgreSQL instance.
    pub database: DatabaseConfig,

    /// Behavior of the guarded data-access layer.
    #[serde(default)]
    pub guard: GuardConfig,
}

/// PostgreSQL connection descriptor.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema to reflect (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Connect timeout in seconds (default: 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// How integer primary keys are chosen when an insert omits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Reuse the smallest free id in `[1, max+1]`.
    ///
    /// Convenient for small reference tables. Ids freed by a delete are
    /// handed out again, so anything outside the database still holding
    /// the old id will silently point at the new row.
    #[default]
    GapFill,
    /// Always `max+1`.
    Monotonic,
}

/// Data-access layer behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Primary key allocation strategy (default: gap_fill).
    #[serde(default)]
    pub id_strategy: IdStrategy,

    /// Pre-check foreign key values before INSERT (default: true).
    #[serde(default = "default_true")]
    pub precheck_foreign_keys: bool,

    /// Path of the DDL phase journal. No journal file when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ddl_journal: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            id_strategy: IdStrategy::default(),
            precheck_foreign_keys: true,
            ddl_journal: None,
        }
    }
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}
