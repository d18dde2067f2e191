//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 fingerprint of the target database identity.
    ///
    /// Stored in the DDL journal so a journal file is never replayed
    /// against a different database. The password is not part of it.
    pub fn database_fingerprint(&self) -> String {
        let db = &self.database;
        let mut hasher = Sha256::new();
        hasher.update(db.host.as_bytes());
        hasher.update(db.port.to_be_bytes());
        hasher.update(db.database.as_bytes());
        hasher.update(db.schema.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
