use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::executor::{ExecutionReport, RemovedFile};
use super::types::{CleanupAction, CleanupPlan, Classification, DeleteReason};
use crate::error::{EngineError, EntryError, ErrorKind};

/// Summary of one invocation. Owned by the caller once returned.
///
/// `errors` is the authoritative list of what could not be processed; a run
/// that returns `Ok` may still have skipped files. An execute-stage `TimedOut`
/// entry may have completed after the report, and is not counted in `bytes_freed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    pub run_id: String,
    pub root: PathBuf,
    pub dry_run: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files_scanned: usize,
    pub temporary_files: usize,
    pub duplicate_candidates: usize,
    pub ignored_files: usize,
    pub duplicate_groups: usize,
    /// Non-kept members across all duplicate groups.
    pub duplicate_files: usize,
    pub planned_deletions: usize,
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub bytes_would_free: u64,
    pub removed: Vec<RemovedFile>,
    pub errors: Vec<EntryError>,
}

/// Folds per-stage outcomes into a [`RunResult`].
#[derive(Debug, Clone)]
pub struct Reporter {
    result: RunResult,
}

impl Reporter {
    pub fn start(root: &Path, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            result: RunResult {
                run_id: uuid::Uuid::new_v4().to_string(),
                root: root.to_path_buf(),
                dry_run,
                cancelled: false,
                started_at: now,
                finished_at: now,
                files_scanned: 0,
                temporary_files: 0,
                duplicate_candidates: 0,
                ignored_files: 0,
                duplicate_groups: 0,
                duplicate_files: 0,
                planned_deletions: 0,
                files_deleted: 0,
                bytes_freed: 0,
                bytes_would_free: 0,
                removed: Vec::new(),
                errors: Vec::new(),
            },
        }
    }

    pub fn run_id(&self) -> &str {
        &self.result.run_id
    }

    pub fn record_walk(&mut self, files_scanned: usize, errors: Vec<EntryError>) {
        self.result.files_scanned += files_scanned;
        self.result.errors.extend(errors);
    }

    pub fn record_classification(&mut self, classification: &Classification) {
        match classification {
            Classification::Temporary(_) => self.result.temporary_files += 1,
            Classification::DuplicateCandidate => self.result.duplicate_candidates += 1,
            Classification::Ignored(_) => self.result.ignored_files += 1,
        }
    }

    pub fn record_errors(&mut self, errors: impl IntoIterator<Item = EntryError>) {
        self.result.errors.extend(errors);
    }

    /// Group counts come from the final plan so temporary precedence is reflected.
    pub fn record_plan(&mut self, plan: &CleanupPlan) {
        let mut kept: BTreeSet<&Path> = BTreeSet::new();
        let mut duplicates = 0;
        for action in &plan.actions {
            if let CleanupAction::Delete {
                reason: DeleteReason::DuplicateOf(original),
                ..
            } = action
            {
                kept.insert(original.as_path());
                duplicates += 1;
            }
        }
        self.result.duplicate_groups = kept.len();
        self.result.duplicate_files = duplicates;
        self.result.planned_deletions = plan.delete_count();
        self.result.bytes_would_free = plan.bytes_to_free();
    }

    pub fn record_execution(&mut self, report: ExecutionReport) {
        self.result.files_deleted += report.removed.len();
        self.result.bytes_freed += report.bytes_freed();
        self.result.removed.extend(report.removed);
        self.result.errors.extend(report.errors);
        self.result.cancelled |= report.cancelled;
    }

    pub fn mark_cancelled(&mut self) {
        self.result.cancelled = true;
    }

    pub fn finish(mut self) -> RunResult {
        self.result.finished_at = Utc::now();
        self.result
            .errors
            .sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.stage.cmp(&b.stage)));
        self.result
    }
}

/// Tagged outcome handed to whatever layer persists or transports runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunEnvelope {
    Ok { result: RunResult },
    Error { kind: ErrorKind, detail: String },
}

impl From<Result<RunResult, EngineError>> for RunEnvelope {
    fn from(outcome: Result<RunResult, EngineError>) -> Self {
        match outcome {
            Ok(result) => RunEnvelope::Ok { result },
            Err(err) => RunEnvelope::Error {
                kind: err.kind(),
                detail: err.to_string(),
            },
        }
    }
}
