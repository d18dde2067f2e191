//! Configuration validation.

use super::Config;
use crate::drivers::common::SslMode;
use crate::error::{GuardError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let db = &config.database;
    if db.host.is_empty() {
        return Err(GuardError::Config("database.host is required".into()));
    }
    if db.database.is_empty() {
        return Err(GuardError::Config("database.database is required".into()));
    }
    if db.user.is_empty() {
        return Err(GuardError::Config("database.user is required".into()));
    }
    if db.schema.is_empty() {
        return Err(GuardError::Config("database.schema cannot be empty".into()));
    }
    if db.port == 0 {
        return Err(GuardError::Config("database.port must be non-zero".into()));
    }
    if db.connect_timeout_secs == 0 {
        return Err(GuardError::Config(
            "database.connect_timeout_secs must be at least 1".into(),
        ));
    }
    SslMode::parse(&db.ssl_mode)?;

    Ok(())
}
