//! Phase journal for multi-phase DDL.
//!
//! Each phase of a structural change is its own statement, so a crash can
//! leave a table half-changed. The journal records every phase as it
//! starts and finishes; an operation still `running` when the journal is
//! next opened was interrupted. Nothing is rolled back automatically.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// Completed operations kept in the file; running ones are never pruned.
const MAX_FINISHED: usize = 100;

/// Status of a journaled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    /// Interrupted and acknowledged by an operator.
    Abandoned,
}

/// Status of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Applied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// One DDL operation and its phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlEntry {
    pub id: u64,
    pub operation: String,
    pub table: String,
    pub column: Option<String>,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
}

impl DdlEntry {
    /// Phases that completed.
    pub fn applied_phases(&self) -> Vec<&str> {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Applied)
            .map(|p| p.name.as_str())
            .collect()
    }
}

/// Journal of DDL operations, optionally persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlJournal {
    /// Fingerprint of the database the journal belongs to.
    pub database: String,
    next_id: u64,
    entries: Vec<DdlEntry>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl DdlJournal {
    /// A journal that is never written to disk.
    pub fn in_memory(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            next_id: 1,
            entries: Vec::new(),
            path: None,
        }
    }

    /// Open the journal at `path`, creating it on first save.
    ///
    /// A journal written for another database is rejected.
    pub fn open<P: AsRef<Path>>(path: P, database: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let mut journal = Self::in_memory(database);
            journal.path = Some(path.to_path_buf());
            return Ok(journal);
        }

        let content = std::fs::read_to_string(path)?;
        let mut journal: Self = serde_json::from_str(&content)?;
        if journal.database != database {
            return Err(GuardError::Config(format!(
                "DDL journal {} belongs to a different database",
                path.display()
            )));
        }
        journal.path = Some(path.to_path_buf());
        Ok(journal)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Save to disk (atomic write), if the journal has a path.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Record the start of an operation and return its id.
    pub fn begin(&mut self, operation: &str, table: &str, column: Option<&str>) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(DdlEntry {
            id,
            operation: operation.to_string(),
            table: table.to_string(),
            column: column.map(str::to_string),
            status: OperationStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
        });
        self.save()?;
        Ok(id)
    }

    pub fn phase_started(&mut self, id: u64, phase: &str) -> Result<()> {
        if let Some(entry) = self.entry_mut(id) {
            entry.phases.push(PhaseRecord {
                name: phase.to_string(),
                status: PhaseStatus::Pending,
                started_at: Utc::now(),
                finished_at: None,
                error: None,
            });
        }
        self.save()
    }

    pub fn phase_applied(&mut self, id: u64, phase: &str) -> Result<()> {
        self.finish_phase(id, phase, PhaseStatus::Applied, None)
    }

    pub fn phase_failed(&mut self, id: u64, phase: &str, error: &str) -> Result<()> {
        self.finish_phase(id, phase, PhaseStatus::Failed, Some(error.to_string()))
    }

    fn finish_phase(
        &mut self,
        id: u64,
        phase: &str,
        status: PhaseStatus,
        error: Option<String>,
    ) -> Result<()> {
        if let Some(record) = self
            .entry_mut(id)
            .and_then(|e| e.phases.iter_mut().rev().find(|p| p.name == phase))
        {
            record.status = status;
            record.finished_at = Some(Utc::now());
            record.error = error;
        }
        self.save()
    }

    /// Close an operation as completed or failed.
    pub fn finish(&mut self, id: u64, succeeded: bool) -> Result<()> {
        if let Some(entry) = self.entry_mut(id) {
            entry.status = if succeeded {
                OperationStatus::Completed
            } else {
                OperationStatus::Failed
            };
            entry.finished_at = Some(Utc::now());
        }
        self.prune();
        self.save()
    }

    /// Operations that never finished.
    pub fn pending(&self) -> Vec<DdlEntry> {
        self.entries
            .iter()
            .filter(|e| e.status == OperationStatus::Running)
            .cloned()
            .collect()
    }

    /// Mark every interrupted operation as abandoned; returns how many.
    pub fn acknowledge_pending(&mut self) -> Result<usize> {
        let mut count = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.status == OperationStatus::Running)
        {
            entry.status = OperationStatus::Abandoned;
            entry.finished_at = Some(Utc::now());
            count += 1;
        }
        self.save()?;
        Ok(count)
    }

    pub fn entries(&self) -> &[DdlEntry] {
        &self.entries
    }

    pub fn get(&self, id: u64) -> Option<&DdlEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn entry_mut(&mut self, id: u64) -> Option<&mut DdlEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    fn prune(&mut self) {
        let finished = self
            .entries
            .iter()
            .filter(|e| e.status != OperationStatus::Running)
            .count();
        let mut excess = finished.saturating_sub(MAX_FINISHED);
        self.entries.retain(|e| {
            if excess > 0 && e.status != OperationStatus::Running {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_phases_recorded_in_order() {
        let mut journal = DdlJournal::in_memory("db");
        let id = journal.begin("add_column", "books", Some("isbn13")).unwrap();
        journal.phase_started(id, "add_column").unwrap();
        journal.phase_applied(id, "add_column").unwrap();
        journal.phase_started(id, "add_unique").unwrap();
        journal.phase_failed(id, "add_unique", "duplicates").unwrap();
        journal.finish(id, false).unwrap();

        let entry = journal.get(id).unwrap();
        assert_eq!(entry.status, OperationStatus::Failed);
        assert_eq!(entry.applied_phases(), vec!["add_column"]);
        assert_eq!(entry.phases[1].error.as_deref(), Some("duplicates"));
        assert!(journal.pending().is_empty());
    }

    #[test]
    fn test_interrupted_operation_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ddl.json");

        let mut journal = DdlJournal::open(&path, "db").unwrap();
        let id = journal.begin("add_column", "books", Some("isbn13")).unwrap();
        journal.phase_started(id, "add_column").unwrap();
        journal.phase_applied(id, "add_column").unwrap();
        journal.phase_started(id, "set_not_null").unwrap();
        drop(journal);

        let mut reopened = DdlJournal::open(&path, "db").unwrap();
        let pending = reopened.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].phases.last().unwrap().status, PhaseStatus::Pending);

        assert_eq!(reopened.acknowledge_pending().unwrap(), 1);
        assert!(DdlJournal::open(&path, "db").unwrap().pending().is_empty());

        let next = reopened.begin("drop_column", "books", Some("isbn13")).unwrap();
        assert_eq!(next, id + 1);
    }

    #[test]
    fn test_journal_for_other_database_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ddl.json");
        let mut journal = DdlJournal::open(&path, "db-a").unwrap();
        journal.begin("rename_table", "books", None).unwrap();

        assert!(DdlJournal::open(&path, "db-b").is_err());
    }

    #[test]
    fn test_prune_keeps_running_entries() {
        let mut journal = DdlJournal::in_memory("db");
        let running = journal.begin("add_column", "books", Some("x")).unwrap();
        for _ in 0..(MAX_FINISHED + 5) {
            let id = journal.begin("rename_table", "t", None).unwrap();
            journal.finish(id, true).unwrap();
        }
        assert_eq!(journal.entries().len(), MAX_FINISHED + 1);
        assert!(journal.get(running).is_some());
    }
}
