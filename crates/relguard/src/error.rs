//! Error types for the data-access layer.

use std::fmt;

use thiserror::Error;

use crate::validate::Violation;

/// Coarse error classification reported to callers.
///
/// Every [`GuardError`] maps to exactly one kind. Only
/// [`ErrorKind::Connectivity`] is eligible for caller-level retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A row violates a declared rule; detected before any SQL was issued.
    Validation,
    /// Unknown table/column, or a name collision.
    Schema,
    /// Rename/drop blocked by live dependents.
    Dependency,
    /// The store rejected a statement (NOT NULL, UNIQUE, FK, CHECK).
    ConstraintViolation,
    /// The store is unreachable.
    Connectivity,
    /// An unsafe DDL request refused before touching the store.
    IntegrityRisk,
    /// Invalid configuration or caller input that is not row data.
    Config,
    /// Local file I/O (configuration, DDL journal).
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Schema => "SchemaError",
            ErrorKind::Dependency => "DependencyError",
            ErrorKind::ConstraintViolation => "ConstraintViolation",
            ErrorKind::Connectivity => "ConnectivityError",
            ErrorKind::IntegrityRisk => "IntegrityRiskError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Io => "IoError",
        };
        f.write_str(name)
    }
}

/// Main error type.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Row failed validation; carries every violated rule.
    #[error("Validation failed for table {table}: {}", format_violations(.violations))]
    Validation {
        table: String,
        violations: Vec<Violation>,
    },

    /// Unknown table/column or name collision.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Operation blocked by dependent objects.
    #[error("Cannot modify {table}.{column}: dependent objects exist ({})", .dependents.join(", "))]
    Dependency {
        table: String,
        column: String,
        dependents: Vec<String>,
    },

    /// Statement rejected by the store.
    #[error("Constraint violation on {table}{}: {message}", column_suffix(.column))]
    Constraint {
        table: String,
        column: Option<String>,
        constraint: Option<String>,
        message: String,
    },

    /// Store unreachable or connection lost.
    #[error("Connectivity error: {message}\n  Context: {context}")]
    Connectivity { message: String, context: String },

    /// Unsafe DDL refused pre-emptively.
    #[error("Integrity risk on {table}.{column}: {message}")]
    IntegrityRisk {
        table: String,
        column: String,
        message: String,
    },

    /// A step of a multi-phase DDL operation failed.
    #[error("Phase '{phase}' failed: {source}")]
    Phase {
        phase: String,
        #[source]
        source: Box<GuardError>,
    },

    /// Statement failed for a reason that is not a constraint or connectivity problem.
    #[error("Statement failed: {0}")]
    Statement(String),

    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn column_suffix(column: &Option<String>) -> String {
    column.as_ref().map(|c| format!(".{}", c)).unwrap_or_default()
}

impl GuardError {
    /// Create a Validation error.
    pub fn validation(table: impl Into<String>, violations: Vec<Violation>) -> Self {
        GuardError::Validation {
            table: table.into(),
            violations,
        }
    }

    /// Create a Schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        GuardError::Schema(message.into())
    }

    /// Create a Connectivity error with context about where it occurred.
    pub fn connectivity(message: impl ToString, context: impl Into<String>) -> Self {
        GuardError::Connectivity {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create an IntegrityRisk error.
    pub fn integrity_risk(
        table: impl Into<String>,
        column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        GuardError::IntegrityRisk {
            table: table.into(),
            column: column.into(),
            message: message.into(),
        }
    }

    /// Wrap an error with the name of the DDL phase it occurred in.
    pub fn in_phase(self, phase: impl Into<String>) -> Self {
        GuardError::Phase {
            phase: phase.into(),
            source: Box::new(self),
        }
    }

    /// The caller-facing classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardError::Validation { .. } => ErrorKind::Validation,
            GuardError::Schema(_) => ErrorKind::Schema,
            GuardError::Dependency { .. } => ErrorKind::Dependency,
            GuardError::Constraint { .. } => ErrorKind::ConstraintViolation,
            GuardError::Statement(_) => ErrorKind::ConstraintViolation,
            GuardError::Connectivity { .. } => ErrorKind::Connectivity,
            GuardError::IntegrityRisk { .. } => ErrorKind::IntegrityRisk,
            GuardError::Phase { source, .. } => source.kind(),
            GuardError::Config(_) | GuardError::Yaml(_) | GuardError::Json(_) => ErrorKind::Config,
            GuardError::Io(_) => ErrorKind::Io,
        }
    }

    /// Name of the failing DDL phase, if this error came from one.
    pub fn phase(&self) -> Option<&str> {
        match self {
            GuardError::Phase { phase, .. } => Some(phase),
            _ => None,
        }
    }

    /// Violations carried by a validation failure.
    pub fn violations(&self) -> &[Violation] {
        match self {
            GuardError::Validation { violations, .. } => violations,
            GuardError::Phase { source, .. } => source.violations(),
            _ => &[],
        }
    }

    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Config => 1,
            ErrorKind::Validation => 2,
            ErrorKind::Schema => 3,
            ErrorKind::Dependency => 4,
            ErrorKind::ConstraintViolation => 5,
            ErrorKind::IntegrityRisk => 6,
            ErrorKind::Io => 7,
            ErrorKind::Connectivity => 8,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error [{}]: {}\n", self.kind(), self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for guarded operations.
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::ViolationKind;

    #[test]
    fn test_phase_inherits_kind() {
        let err = GuardError::integrity_risk("books", "isbn", "duplicates present")
            .in_phase("add_unique");
        assert_eq!(err.kind(), ErrorKind::IntegrityRisk);
        assert_eq!(err.phase(), Some("add_unique"));
        assert!(err.to_string().contains("add_unique"));
    }

    #[test]
    fn test_only_connectivity_is_retryable() {
        assert!(GuardError::connectivity("refused", "connect").is_retryable());
        assert!(!GuardError::schema("no table").is_retryable());
        assert!(!GuardError::Constraint {
            table: "t".into(),
            column: None,
            constraint: None,
            message: "dup".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_validation_message_lists_violations() {
        let err = GuardError::validation(
            "readers",
            vec![Violation::new(
                "deposit_amount",
                ViolationKind::Range,
                "value -5 is below minimum 0",
            )],
        );
        let msg = err.to_string();
        assert!(msg.contains("readers"));
        assert!(msg.contains("deposit_amount"));
        assert_eq!(err.violations().len(), 1);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let err = GuardError::schema("column exists").in_phase("add_column");
        let detailed = err.format_detailed();
        assert!(detailed.contains("SchemaError"));
        assert!(detailed.contains("Caused by"));
    }
}
