//! Classification of driver errors into the crate's error kinds.
//!
//! Constraint violations are reported by the server with structured fields
//! (table, column, constraint) when it knows them. Older servers and some
//! statement shapes leave the fields empty, so the column is recovered from
//! the message or detail text as a fallback.

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_postgres::error::{DbError, SqlState};

use crate::error::GuardError;

static RE_QUOTED_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"column "([^"]+)""#).expect("valid regex"));
static RE_KEY_COLUMNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Key \(([^)]+)\)=").expect("valid regex"));
static RE_RELATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:relation|table) "([^"]+)""#).expect("valid regex"));

/// Classify a tokio-postgres error raised while running `context`.
pub fn classify(err: tokio_postgres::Error, context: &str) -> GuardError {
    if let Some(db) = err.as_db_error() {
        return classify_db_error(db, context);
    }
    if err.is_closed() || is_io_error(&err) {
        return GuardError::connectivity(err, context);
    }
    GuardError::Statement(format!("{}: {}", context, err))
}

/// Classify a pool error (timeouts and failed connection attempts).
pub fn classify_pool(err: deadpool_postgres::PoolError, context: &str) -> GuardError {
    match err {
        deadpool_postgres::PoolError::Backend(e) => classify(e, context),
        other => GuardError::connectivity(other, context),
    }
}

fn is_io_error(err: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if e.is::<std::io::Error>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn classify_db_error(db: &DbError, context: &str) -> GuardError {
    let code = db.code();
    let detail = db.detail().unwrap_or_default();

    if code.code().starts_with("08")
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
    {
        return GuardError::connectivity(db.message(), context);
    }

    let reason = if *code == SqlState::NOT_NULL_VIOLATION {
        "a value is required"
    } else if *code == SqlState::UNIQUE_VIOLATION {
        "duplicate value"
    } else if *code == SqlState::FOREIGN_KEY_VIOLATION {
        "referenced row does not exist or is still referenced"
    } else if *code == SqlState::CHECK_VIOLATION {
        "check constraint rejected the row"
    } else if *code == SqlState::EXCLUSION_VIOLATION {
        "exclusion constraint rejected the row"
    } else {
        return GuardError::Statement(format!(
            "{}: {} (SQLSTATE {})",
            context,
            db.message(),
            code.code()
        ));
    };

    let table = db
        .table()
        .map(str::to_string)
        .or_else(|| capture(&RE_RELATION, db.message()))
        .unwrap_or_default();
    let column = db
        .column()
        .map(str::to_string)
        .or_else(|| column_from_text(db.message(), detail));

    let mut message = format!("{}: {}", reason, db.message());
    if !detail.is_empty() {
        message.push_str(&format!(" ({})", detail));
    }

    GuardError::Constraint {
        table,
        column,
        constraint: db.constraint().map(str::to_string),
        message,
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Column named in a constraint error's message or detail text.
fn column_from_text(message: &str, detail: &str) -> Option<String> {
    capture(&RE_QUOTED_COLUMN, message).or_else(|| capture(&RE_KEY_COLUMNS, detail))
}
