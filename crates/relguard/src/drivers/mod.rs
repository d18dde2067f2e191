//! Database driver implementations.
//!
//! - [`postgres`]: PostgreSQL store and schema reflection
//! - [`common`]: Shared utilities (TLS)

pub mod common;
pub mod postgres;

pub use common::{SslMode, TlsBuilder};
pub use postgres::PgStore;
