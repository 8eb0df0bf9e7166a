//! Versioned schema migrations.
//!
//! Migration files live in one directory and are named `NNN_description.sql`.
//! The numeric prefix is the migration id.  Applied migrations are recorded
//! in a `migrations` ledger table together with the SHA-256 checksum of the
//! file as it was applied, so later edits can be detected as drift.
//!
//! The [`MigrationRunner`] is bound to one adapter and drives the whole
//! cycle: discover, ensure ledger, diff, execute pending, record.

mod discover;
mod runner;
mod split;

use serde::Serialize;

pub use discover::{checksum, discover, parse_id};
pub use runner::{MigrationPlan, MigrationRunner};
pub use split::split_statements;

/// Name of the ledger table.
pub const LEDGER_TABLE: &str = "migrations";

/// One migration file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub id: u32,
    pub filename: String,
    pub content: String,
    /// Lowercase hex SHA-256 of `content`.
    pub checksum: String,
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub id: u32,
    pub filename: String,
    pub executed_at: String,
    pub checksum: String,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Filenames applied by this run, in order.
    pub applied: Vec<String>,
    /// Applied migrations whose file changed since they ran.
    pub drifted: Vec<DriftFinding>,
}

impl MigrationReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Per-file state relative to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Executed,
    Pending,
    /// Executed, but the file's checksum no longer matches the ledger.
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFileStatus {
    pub id: u32,
    pub filename: String,
    pub state: MigrationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<String>,
}

/// Read-only snapshot of every migration file and its ledger state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub total: usize,
    pub executed: usize,
    pub pending: usize,
    pub files: Vec<MigrationFileStatus>,
}

/// An applied migration whose file no longer matches the ledger checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftFinding {
    pub id: u32,
    pub filename: String,
    pub recorded_checksum: String,
    pub current_checksum: String,
}

/// Ids missing between two consecutive migration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceGap {
    pub after: u32,
    pub before: u32,
}

/// Result of [`MigrationRunner::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationFindings {
    pub modified: Vec<DriftFinding>,
    /// Ledger rows with no corresponding file on disk.
    pub missing_files: Vec<MigrationRecord>,
    pub gaps: Vec<SequenceGap>,
}

impl ValidationFindings {
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty() && self.missing_files.is_empty() && self.gaps.is_empty()
    }
}
